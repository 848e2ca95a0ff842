//! Client-side half of the sync engine: what a widget or agent dashboard runs
//! to turn racing call results and broadcast deliveries into one converged
//! view per chat, plus the alert policy on top of it.

pub mod dedup;
pub mod gate;
pub mod reconciler;
pub mod transport;

pub use dedup::{message_fingerprint, FingerprintCache};
pub use gate::{Alert, AlertKind, NotificationGate, Visibility};
pub use reconciler::{
    CachedView, Change, ChatView, ClientReconciler, ClientTunables, PendingSend, Reconciled, ReconcilerConfig,
    Surface, ViewMessage,
};
pub use transport::{submit_send, ChatTransport, ClientSession, HttpTransport, SendFailure};
