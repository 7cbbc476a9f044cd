//! Question extraction from wire-format DNS messages.

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

use crate::error::RecordError;

/// One entry of a DNS question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Fully-qualified name, always ending in a dot.
    pub name: String,
    /// Requested record type.
    pub record_type: RecordType,
}

impl Question {
    /// Canonical text form of the record type, e.g. `AAAA` or `TYPE65280`.
    pub fn type_label(&self) -> String {
        record_type_label(self.record_type)
    }
}

/// Render a record type the way it appears in zone files.
pub fn record_type_label(record_type: RecordType) -> String {
    match record_type {
        RecordType::Unknown(code) => format!("TYPE{code}"),
        other => other.to_string(),
    }
}

/// Parse `bytes` and return its questions in wire order.
pub fn extract_questions(bytes: &[u8]) -> Result<Vec<Question>, RecordError> {
    let message = Message::from_vec(bytes)?;

    Ok(message
        .queries()
        .iter()
        .map(|query| {
            let mut name = query.name().to_string();
            if !name.ends_with('.') {
                name.push('.');
            }
            Question {
                name,
                record_type: query.query_type(),
            }
        })
        .collect())
}
