use std::fmt::Write as _;

use log::LevelFilter;
use serde_json::json;

use crate::dap::client::ClientSender;
use crate::dap::protocol::event;

/// Logger that keeps the default `env_logger` output and additionally
/// forwards every record to the client as a `vmdap.log` event.
pub struct ClientLogger {
    inner: env_logger::Logger,
    client: ClientSender,
}

impl ClientLogger {
    pub fn new(client: ClientSender) -> Self {
        Self {
            inner: env_logger::Logger::from_default_env(),
            client,
        }
    }

    pub fn filter(&self) -> LevelFilter {
        // client side logging wants at least the runtime traffic summaries
        self.inner.filter().max(LevelFilter::Debug)
    }
}

impl log::Log for ClientLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.filter()
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            self.inner.log(record);
        }

        let mut message = String::new();
        let _ = write!(message, "[{}] {}: {}", record.level(), record.target(), record.args());
        self.client
            .try_send_event(event::LOG, json!({ "message": message }));
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn test_record_forwarded_to_client() {
        let (client, mut rx) = ClientSender::new();
        let logger = ClientLogger::new(client);

        logger.log(
            &log::Record::builder()
                .level(log::Level::Debug)
                .target("vm")
                .args(format_args!("-> getVM"))
                .build(),
        );

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.event_name(), Some(event::LOG));
        assert_eq!(
            msg.body().unwrap()["message"],
            json!("[DEBUG] vm: -> getVM")
        );
    }
}
