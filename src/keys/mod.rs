pub mod cert;
pub mod directory;
pub mod identity;
pub mod reconcile;
pub mod resolver;
pub mod store;

pub use cert::{Cert, Fingerprint, UserId, Validity};
pub use reconcile::{CandidateKey, KeyReconciler, KeySource, Outcome};
pub use store::{Keyring, KeyringId};
