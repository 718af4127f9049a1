use std::sync::Arc;

use crate::message;
use crate::transport::MailTransport;

/// Turns raw payloads into mail. Shared by both listeners.
///
/// Holds no mutable state, so one dispatcher can serve concurrent callers.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn MailTransport>) -> Dispatcher {
        Dispatcher { transport }
    }

    /// Parse `payload` (falling back to a malformed-message notification),
    /// render it, and hand it to the transport.
    ///
    /// Never fails: every problem is logged, and nothing is retried.
    pub async fn dispatch(&self, payload: &[u8]) {
        log::debug!("Dispatching payload of {} bytes", payload.len());

        let text = message::parse(payload).render();
        log::info!("Message received: {}", String::from_utf8_lossy(&text));

        let name = self.transport.name();
        match self.transport.send(&text).await {
            Ok(output) => {
                if !output.success() {
                    match output.exit_code {
                        Some(code) => {
                            log::error!("Error in transmission: {} exited with status {}", name, code)
                        }
                        None => log::error!("Error in transmission: {} was killed by a signal", name),
                    }
                }
                if !output.stdout.is_empty() {
                    log::info!("{} stdout: {}", name, output.stdout);
                }
                if !output.stderr.is_empty() {
                    log::info!("{} stderr: {}", name, output.stderr);
                }
            }
            Err(e) => {
                log::error!("Error in transmission: {:#}", e);
            }
        }
    }
}
