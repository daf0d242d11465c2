/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No attempt has completed yet. Listeners treat this like `Online` and
    /// wait for server results before raising an initial snapshot.
    #[default]
    Unknown,
    Online,
    /// Connection failed or the network was disabled; cached results are
    /// raised immediately.
    Offline,
}
