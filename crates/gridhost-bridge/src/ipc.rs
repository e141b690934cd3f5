use crossbeam_channel::{Receiver, Sender};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Messages the supervisor writes to a worker's stdin, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    Stop,
}

/// Messages a worker writes to its stdout, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    Ready { port: u16 },
    Stopping,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty protocol line")]
    Empty,
    #[error("malformed protocol line: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn control_channel() -> (Sender<ControlMessage>, Receiver<ControlMessage>) {
    crossbeam_channel::unbounded()
}

pub fn event_channel() -> (Sender<WorkerEvent>, Receiver<WorkerEvent>) {
    crossbeam_channel::unbounded()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ready_event_is_single_line() {
        let line = encode_line(&WorkerEvent::Ready { port: 55056 }).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let decoded: WorkerEvent = decode_line(&line).unwrap();
        assert_eq!(decoded, WorkerEvent::Ready { port: 55056 });
    }

    #[test]
    fn blank_and_garbage_lines_are_rejected() {
        assert!(matches!(
            decode_line::<ControlMessage>("   \n"),
            Err(ProtocolError::Empty)
        ));
        assert!(matches!(
            decode_line::<ControlMessage>("{\"type\":\"Explode\"}"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn channels_transfer_messages() {
        let (tx, rx) = control_channel();
        tx.send(ControlMessage::Stop).unwrap();
        assert_eq!(rx.recv().unwrap(), ControlMessage::Stop);
    }
}
