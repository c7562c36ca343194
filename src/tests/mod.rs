use lazy_static::lazy_static;
use std::sync::Mutex;


lazy_static! {
    /// Serializes tests that touch `RUST_LOG` or the global subscriber.
    pub(crate) static ref ENV_GUARD: Mutex<()> = Mutex::new(());
}
