//! Driver log lines routed into the control channel.

use std::sync::Arc;
use std::thread;

use crate::channel::ControlPlane;
use crate::trace::{debug, info};

/// Writes driver messages into the channel's log ring and mirrors them to
/// `tracing`.
///
/// Each line is prefixed with the calling thread's id, e.g.
/// `ThreadId(3): HmdDriver activated as 0`. Trailing newlines are stripped;
/// the ring stores lines, not text. A full ring drops the line.
#[derive(Clone)]
pub struct ChannelLogger {
    channel: Arc<dyn ControlPlane>,
}

impl ChannelLogger {
    #[must_use]
    pub fn new(channel: Arc<dyn ControlPlane>) -> Self {
        Self { channel }
    }

    /// Records `message`. Returns `false` if the ring dropped it.
    pub fn log(&self, message: &str) -> bool {
        let message = message.trim_end_matches(['\r', '\n']);
        info!(target: "spvr::driver", "{message}");
        self.channel.log(&prefixed(message))
    }

    /// Like [`ChannelLogger::log`], but only in debug builds. Release builds
    /// skip the channel and emit a `debug!` event instead.
    pub fn debug(&self, message: &str) -> bool {
        if cfg!(debug_assertions) {
            self.log(message)
        } else {
            debug!(target: "spvr::driver", "{}", message.trim_end_matches(['\r', '\n']));
            false
        }
    }
}

fn prefixed(message: &str) -> String {
    format!("{:?}: {message}", thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;

    #[test]
    fn lines_carry_calling_thread_id() {
        let channel = Arc::new(MemoryChannel::new());
        let logger = ChannelLogger::new(channel.clone());

        assert!(logger.log("Activate(0)\n"));
        let here = format!("{:?}: Activate(0)", thread::current().id());

        let other = {
            let logger = logger.clone();
            thread::spawn(move || {
                logger.log("from worker");
                thread::current().id()
            })
            .join()
            .unwrap()
        };

        assert_eq!(
            channel.drain_log(),
            [here, format!("{other:?}: from worker")]
        );
    }

    #[test]
    fn debug_lines_follow_build_profile() {
        let channel = Arc::new(MemoryChannel::new());
        let logger = ChannelLogger::new(channel.clone());
        logger.debug("Context created");
        assert_eq!(
            channel.drain_log().len(),
            usize::from(cfg!(debug_assertions))
        );
    }
}
