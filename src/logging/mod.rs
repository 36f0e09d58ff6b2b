//! Buffered per-request logging
//!
//! Every message produced while a session is being processed is buffered
//! under the session's numeric id. When the terminal
//! [`MessageType::FinishedProcessingRequest`] record arrives the whole
//! buffer is emitted through the `log` facade in insertion order, framed
//! with box-drawing glyphs so a request reads as one grouped block even
//! when sessions interleave.

use dashmap::DashMap;
use log::Level;

/// Classification of a buffered log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    InterceptedRequest,
    InterceptedResponse,
    PassedThrough,
    Chaos,
    Warning,
    Mocked,
    Failed,
    Tip,
    Skipped,
    FinishedProcessingRequest,
}

impl MessageType {
    fn label(&self) -> &'static str {
        match self {
            MessageType::InterceptedRequest => "request",
            MessageType::InterceptedResponse => "api response",
            MessageType::PassedThrough => "passed through",
            MessageType::Chaos => "chaos",
            MessageType::Warning => "warning",
            MessageType::Mocked => "mocked",
            MessageType::Failed => "failed",
            MessageType::Tip => "tip",
            MessageType::Skipped => "skipped",
            MessageType::FinishedProcessingRequest => "done",
        }
    }

    fn level(&self) -> Level {
        match self {
            MessageType::Failed => Level::Error,
            MessageType::Warning | MessageType::Chaos => Level::Warn,
            MessageType::Skipped => Level::Debug,
            _ => Level::Info,
        }
    }
}

/// One buffered record for a session.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub message_lines: Vec<String>,
    pub message_type: MessageType,
    pub plugin_name: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
}

impl RequestLog {
    pub fn new(message_type: MessageType, message_lines: Vec<String>) -> Self {
        Self {
            message_lines,
            message_type,
            plugin_name: None,
            method: None,
            url: None,
        }
    }

    pub fn single(message_type: MessageType, line: impl Into<String>) -> Self {
        Self::new(message_type, vec![line.into()])
    }

    pub fn with_plugin(mut self, plugin_name: impl Into<String>) -> Self {
        self.plugin_name = Some(plugin_name.into());
        self
    }

    pub fn with_request(mut self, method: impl Into<String>, url: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.url = Some(url.into());
        self
    }
}

/// Buffers request log records and flushes them as one block per session.
pub struct RequestLogger {
    buffers: DashMap<u64, Vec<RequestLog>>,
    show_skip_messages: bool,
}

impl RequestLogger {
    pub fn new(show_skip_messages: bool) -> Self {
        Self {
            buffers: DashMap::new(),
            show_skip_messages,
        }
    }

    /// Append a record to the session's buffer.
    ///
    /// A [`MessageType::FinishedProcessingRequest`] record must go through
    /// [`RequestLogger::complete`] instead; it is rejected here so a session
    /// cannot end up with two terminal records.
    pub fn log(&self, request_id: u64, record: RequestLog) {
        debug_assert!(record.message_type != MessageType::FinishedProcessingRequest);
        if record.message_type == MessageType::Skipped && !self.show_skip_messages {
            return;
        }
        self.buffers.entry(request_id).or_default().push(record);
    }

    /// Flush the session: emit all buffered records in insertion order,
    /// followed by the terminal record, then drop the buffer.
    ///
    /// Returns the flushed records (terminal record included) so the caller
    /// can dispatch per-record events over them.
    pub fn complete(&self, request_id: u64, method: &str, url: &str) -> Vec<RequestLog> {
        let mut records = self
            .buffers
            .remove(&request_id)
            .map(|(_, records)| records)
            .unwrap_or_default();
        records.push(
            RequestLog::single(MessageType::FinishedProcessingRequest, String::new())
                .with_request(method, url),
        );

        self.emit(request_id, &records);
        records
    }

    fn emit(&self, request_id: u64, records: &[RequestLog]) {
        let last = records.len() - 1;
        for (idx, record) in records.iter().enumerate() {
            let glyph = if idx == 0 {
                '╭'
            } else if idx == last {
                '╰'
            } else {
                '├'
            };
            let label = record.message_type.label();
            let level = record.message_type.level();

            match record.message_type {
                MessageType::FinishedProcessingRequest => {
                    let method = record.method.as_deref().unwrap_or_default();
                    let url = record.url.as_deref().unwrap_or_default();
                    log::log!(level, "{glyph} {label:<14} {method} {url} [#{request_id}]");
                }
                _ => {
                    for (line_idx, line) in record.message_lines.iter().enumerate() {
                        if line_idx == 0 {
                            log::log!(level, "{glyph} {label:<14} {line}");
                        } else {
                            log::log!(level, "│ {:<14} {line}", "");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_complete_drains_buffer_in_order() {
        init_log();
        let logger = RequestLogger::new(false);
        logger.log(7, RequestLog::single(MessageType::InterceptedRequest, "GET /me"));
        logger.log(7, RequestLog::single(MessageType::Chaos, "503 injected"));

        let records = logger.complete(7, "GET", "https://graph.microsoft.com/v1.0/me");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message_type, MessageType::InterceptedRequest);
        assert_eq!(records[1].message_type, MessageType::Chaos);
        assert_eq!(
            records[2].message_type,
            MessageType::FinishedProcessingRequest
        );

        // Buffer is gone; a second completion carries only the terminal record.
        let records = logger.complete(7, "GET", "https://graph.microsoft.com/v1.0/me");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_exactly_one_terminal_record() {
        init_log();
        let logger = RequestLogger::new(false);
        logger.log(1, RequestLog::single(MessageType::Mocked, "200 from mock"));
        let records = logger.complete(1, "GET", "https://example.com/");
        let terminals = records
            .iter()
            .filter(|r| r.message_type == MessageType::FinishedProcessingRequest)
            .count();
        assert_eq!(terminals, 1);
        assert_eq!(records.last().unwrap().message_type, MessageType::FinishedProcessingRequest);
    }

    #[test]
    fn test_skipped_suppressed_by_default() {
        init_log();
        let logger = RequestLogger::new(false);
        logger.log(2, RequestLog::single(MessageType::Skipped, "response already set"));
        let records = logger.complete(2, "GET", "https://example.com/");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_skipped_kept_when_enabled() {
        init_log();
        let logger = RequestLogger::new(true);
        logger.log(3, RequestLog::single(MessageType::Skipped, "response already set"));
        let records = logger.complete(3, "GET", "https://example.com/");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message_type, MessageType::Skipped);
    }

    #[test]
    fn test_sessions_do_not_interfere() {
        init_log();
        let logger = RequestLogger::new(false);
        logger.log(10, RequestLog::single(MessageType::InterceptedRequest, "GET /a"));
        logger.log(11, RequestLog::single(MessageType::InterceptedRequest, "GET /b"));

        let a = logger.complete(10, "GET", "https://example.com/a");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].message_lines[0], "GET /a");

        let b = logger.complete(11, "GET", "https://example.com/b");
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].message_lines[0], "GET /b");
    }
}
