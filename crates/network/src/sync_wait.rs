//! Helpers for awaiting a `watch::Receiver<bool>` condition without
//! holding the non-`Send` guard returned by `Receiver::wait_for` across
//! an `.await` point (which would make the enclosing future non-`Send`
//! and thus unusable with `tokio::spawn`).

use tokio::sync::watch;

/// Await until the watched value satisfies `pred`.
pub async fn wait_until(rx: &mut watch::Receiver<bool>, pred: impl Fn(bool) -> bool) {
    loop {
        if pred(*rx.borrow()) {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
