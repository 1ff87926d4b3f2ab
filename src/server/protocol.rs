//! Command/status schema and framing for the request socket.
//!
//! Every message is a length-prefixed frame: a `u32` little-endian byte
//! count followed by that many bytes. Commands and statuses are JSON inside
//! their frame; bulk payloads (serialized sub-projects, cursor sets) travel
//! as a separate binary frame immediately after the message announcing
//! them.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_SIZE: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Symbol,
    Identify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryQualifier {
    Any,
    Declaration,
    Definition,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Query {
        project_name: String,
        directory_name: String,
        query_type: QueryType,
        qualifier: QueryQualifier,
        #[serde(default)]
        symbol_name: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        line: u32,
        #[serde(default)]
        column: u32,
    },
    DumpTranslationUnit {
        project_name: String,
        file_name: String,
    },
    /// Followed by one binary frame: the serialized sub-project.
    UpdateTranslationUnit {
        project_name: String,
        directory_name: String,
        file_name: String,
    },
    QueryStatistics {
        project_name: String,
        group: String,
    },
    AnalyzeData {
        project_name: String,
        group: String,
    },
    SaveDatabase {
        project_name: String,
        directory_name: String,
    },
    LoadDatabase {
        project_name: String,
        directory_name: String,
    },
    ShutDown,
}

impl Command {
    /// Whether a binary payload frame follows the command frame.
    pub fn carries_payload(&self) -> bool {
        matches!(self, Command::UpdateTranslationUnit { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    Idle,
    /// Followed by one binary frame: the serialized cursor set.
    QueryResults,
    QueryNoResults,
    UnknownProject,
    TranslationUnitUpdated,
    StatisticsRemarks,
    OperationFailed,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub status_type: StatusType,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub remarks: Vec<String>,
}

impl Status {
    pub fn new(status_type: StatusType) -> Self {
        Self {
            status_type,
            timestamp_ms: now_ms(),
            remarks: Vec::new(),
        }
    }

    pub fn with_remarks(status_type: StatusType, remarks: Vec<String>) -> Self {
        Self {
            status_type,
            timestamp_ms: now_ms(),
            remarks,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::with_remarks(StatusType::OperationFailed, vec![detail.into()])
    }

    pub fn carries_payload(&self) -> bool {
        self.status_type == StatusType::QueryResults
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub async fn read_frame<R>(stream: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut length_raw = [0u8; 4];
    stream.read_exact(&mut length_raw).await?;
    let length = u32::from_le_bytes(length_raw);
    if length > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {length} bytes exceeds the protocol limit"),
        ));
    }

    let mut bytes = vec![0u8; length as usize];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

pub async fn write_message<W, T>(stream: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(stream, &bytes).await
}

pub async fn read_message<R, T>(stream: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let bytes = read_frame(stream).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, b"hello frames").await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, b"hello frames");
    }

    #[tokio::test]
    async fn commands_survive_the_json_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let command = Command::Query {
            project_name: "demo".into(),
            directory_name: "/src".into(),
            query_type: QueryType::Symbol,
            qualifier: QueryQualifier::Definition,
            symbol_name: Some("main".into()),
            file_name: None,
            line: 0,
            column: 0,
        };

        write_message(&mut client, &command).await.unwrap();
        let received: Command = read_message(&mut server).await.unwrap();
        assert_eq!(received, command);
        assert!(!received.carries_payload());
    }

    #[tokio::test]
    async fn statuses_carry_remarks() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let status = Status::with_remarks(
            StatusType::StatisticsRemarks,
            vec!["Indexed 3 symbols".into()],
        );
        write_message(&mut server, &status).await.unwrap();

        let received: Status = read_message(&mut client).await.unwrap();
        assert_eq!(received.status_type, StatusType::StatisticsRemarks);
        assert_eq!(received.remarks, vec!["Indexed 3 symbols".to_string()]);
    }

    #[test]
    fn update_command_announces_its_payload() {
        let command = Command::UpdateTranslationUnit {
            project_name: "demo".into(),
            directory_name: "/src".into(),
            file_name: "/src/a.c".into(),
        };
        assert!(command.carries_payload());
        assert!(Status::new(StatusType::QueryResults).carries_payload());
        assert!(!Status::new(StatusType::QueryNoResults).carries_payload());
    }
}
