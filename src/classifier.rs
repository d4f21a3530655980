use serde::Serialize;
use serde_json::{Map, Value, json};

/// The five runtime error kinds journaled by the Error Journal. Control-plane
/// errors (`ALREADY_RUNNING`, `INVALID_ARGUMENT`, `NOT_FOUND`) are a separate
/// enum (`SupervisorError`) — they never reach the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    DiskSpace,
    ProcessCrash,
    Transcoder,
    System,
}

/// Context passed alongside the raw message; presently only
/// `process_crashed` changes classification, but the map carries whatever
/// extra detail the caller already has (return code, stderr tail, ...).
#[derive(Debug, Default, Clone)]
pub struct ClassificationContext {
    pub process_crashed: bool,
    pub extra: Map<String, Value>,
}

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "connection reset by peer",
    "network is unreachable",
    "no route to host",
    "temporary failure in name resolution",
    "name or service not known",
    "failed to resolve hostname",
    "404 not found",
    "403 forbidden",
    "500 internal server error",
    "http error",
    "tls fatal alert",
    "ssl connection error",
    "input/output error",
    "protocol error",
    "server returned 4xx",
    "server returned 5xx",
    "invalid data found when processing input",
    "end of file",
];

const DISK_SPACE_PATTERNS: &[&str] = &[
    "no space left on device",
    "disk full",
    "cannot write",
    "permission denied",
];

const TRANSCODER_PATTERNS: &[&str] = &[
    "invalid data found when processing input",
    "decoder (codec",
    "stream mapping",
    "output file is empty",
    "conversion failed",
];

/// Pure classification: `(message, context) -> (kind, detail)`. Precedence
/// matches the original exactly: network, then disk space, then
/// process-crash context, then transcoder patterns, else system.
pub fn classify(message: &str, ctx: &ClassificationContext) -> (ErrorKind, Map<String, Value>) {
    let lower = message.to_lowercase();

    if let Some(pattern) = NETWORK_PATTERNS.iter().find(|p| lower.contains(*p)) {
        let mut detail = ctx.extra.clone();
        let (subtype, action) = network_subtype(&lower, pattern);
        detail.insert("subtype".to_string(), json!(subtype));
        detail.insert("suggested_action".to_string(), json!(action));
        return (ErrorKind::Network, detail);
    }

    if DISK_SPACE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return (ErrorKind::DiskSpace, ctx.extra.clone());
    }

    if ctx.process_crashed {
        return (ErrorKind::ProcessCrash, ctx.extra.clone());
    }

    if let Some(pattern) = TRANSCODER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        let mut detail = ctx.extra.clone();
        let (subtype, action) = transcoder_subtype(pattern);
        detail.insert("subtype".to_string(), json!(subtype));
        detail.insert("suggested_action".to_string(), json!(action));
        return (ErrorKind::Transcoder, detail);
    }

    (ErrorKind::System, ctx.extra.clone())
}

fn network_subtype(lower: &str, matched: &str) -> (&'static str, &'static str) {
    if matched.contains("connection refused") || matched.contains("connection timed out") {
        (
            "connection_failed",
            "Verify the upstream stream URL is reachable and the host is not rejecting connections.",
        )
    } else if matched.contains("404") || matched.contains("403") || matched.contains("500") {
        (
            "http_error",
            "The upstream returned an HTTP error status; confirm the stream URL and any required auth.",
        )
    } else if lower.contains("name resolution") || lower.contains("name or service") || lower.contains("resolve hostname") {
        (
            "dns_error",
            "DNS resolution failed for the upstream host; check the hostname and resolver configuration.",
        )
    } else if lower.contains("ssl") || lower.contains("tls") {
        (
            "ssl_error",
            "TLS/SSL handshake with the upstream failed; check certificates and protocol support.",
        )
    } else {
        (
            "general_network",
            "A network error occurred while reading the upstream stream; retry once connectivity is restored.",
        )
    }
}

fn transcoder_subtype(matched: &str) -> (&'static str, &'static str) {
    if matched.contains("invalid data") {
        (
            "invalid_input_data",
            "The upstream sent malformed or unrecognized data; verify the stream's codec and container.",
        )
    } else if matched.contains("decoder") {
        (
            "decoder_error",
            "The configured decoder could not handle the input; check the transcoder's codec support.",
        )
    } else if matched.contains("stream mapping") {
        (
            "stream_mapping_error",
            "No matching audio stream was found to map; verify the source has an audio track.",
        )
    } else {
        (
            "general_ffmpeg_error",
            "The transcoder exited unexpectedly; inspect stderr for the underlying cause.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ClassificationContext {
        ClassificationContext::default()
    }

    #[test]
    fn classifies_connection_refused_as_network() {
        let (kind, detail) = classify("Connection refused", &ctx());
        assert_eq!(kind, ErrorKind::Network);
        assert_eq!(detail["subtype"], json!("connection_failed"));
    }

    #[test]
    fn classifies_disk_space() {
        let (kind, _) = classify("No space left on device", &ctx());
        assert_eq!(kind, ErrorKind::DiskSpace);
    }

    #[test]
    fn process_crash_takes_precedence_over_transcoder_patterns() {
        let mut c = ctx();
        c.process_crashed = true;
        let (kind, _) = classify("Decoder (codec h264) not found", &c);
        assert_eq!(kind, ErrorKind::ProcessCrash);
    }

    #[test]
    fn classifies_transcoder_without_crash_context() {
        let (kind, detail) = classify("Stream mapping failed", &ctx());
        assert_eq!(kind, ErrorKind::Transcoder);
        assert_eq!(detail["subtype"], json!("stream_mapping_error"));
    }

    #[test]
    fn falls_back_to_system() {
        let (kind, _) = classify("something unrelated happened", &ctx());
        assert_eq!(kind, ErrorKind::System);
    }

    #[test]
    fn classification_is_total_and_exclusive() {
        let samples = [
            "Connection refused",
            "No space left on device",
            "Stream mapping failed",
            "totally unrecognized text",
        ];
        for s in samples {
            let (_kind, _) = classify(s, &ctx());
        }
    }
}
