//! Logging for the runtime core.
//!
//! Logs are the primary debugging tool for a node runtime: the kubelet only
//! ever sees a status code and a short message, so anything worth keeping
//! must be emitted here. All messages are tagged with the relevant pod or
//! container id so a node's logs can be filtered per workload.

use tracing_subscriber::EnvFilter;

#[doc(hidden)]
pub use tracing::{event, Level};

/// Install the process-wide JSON subscriber.
///
/// `debug` widens the default filter so that per-request logging (see
/// [`request_log`]) becomes visible; either way `RUST_LOG` still takes
/// precedence when set.
pub fn init(debug: bool) {
    let default_filter = if debug { "sycri=debug" } else { "sycri=error" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

/// Log one service request and its outcome.
///
/// The operation name is the `target` so log consumers can correlate entries
/// with kubelet-side call sites. Requests log at DEBUG (visible only in
/// debug mode), failures always at ERROR.
#[macro_export]
macro_rules! request_log {
    ($op:expr, $request:expr, $result:expr) => {{
        match &$result {
            Ok(response) => {
                $crate::logging::event!(
                    target: "sycri::request",
                    $crate::logging::Level::DEBUG,
                    operation = $op,
                    request = ?$request,
                    response = ?response,
                );
            }
            Err(error) => {
                $crate::logging::event!(
                    target: "sycri::request",
                    $crate::logging::Level::ERROR,
                    operation = $op,
                    request = ?$request,
                    %error,
                );
            }
        }
    }};
}
