//! Chunked bulk transfer: StartTransfer / DataChunk* / EndTransfer over an
//! already-authenticated connection. One transfer in flight per connection;
//! callers serialize transfer initiation with other traffic on the socket.

use std::cmp::min;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::protocol::{
    unix_now, DataChunk, Envelope, FileKind, StartTransfer, TransferStatus,
};
use crate::storage::ClientVault;
use crate::wire::{read_frame, write_frame, WireError};

pub const CHUNK_SIZE: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("chunk {got} arrived out of order (expected {expected})")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("invalid chunk encoding: {0}")]
    BadChunk(#[from] base64::DecodeError),
    #[error("unexpected message tag {0} during transfer")]
    UnexpectedMessage(u64),
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub fn new_transfer_id() -> String {
    Uuid::new_v4().to_string()
}

fn start_message(
    transfer_id: &str,
    kind: FileKind,
    file_name: &str,
    total_size: u64,
) -> StartTransfer {
    StartTransfer {
        transfer_id: transfer_id.to_string(),
        file_type: kind,
        file_name: file_name.to_string(),
        total_size,
        total_chunks: total_size.div_ceil(CHUNK_SIZE),
        chunk_size: CHUNK_SIZE,
        time: unix_now(),
    }
}

fn chunk_message(transfer_id: &str, chunk_index: u64, data: &[u8]) -> DataChunk {
    DataChunk {
        transfer_id: transfer_id.to_string(),
        chunk_index,
        data: STANDARD.encode(data),
        time: unix_now(),
    }
}

fn end_message(transfer_id: &str, status: TransferStatus) -> Envelope {
    Envelope::EndTransfer(crate::protocol::EndTransfer {
        transfer_id: transfer_id.to_string(),
        status,
        time: unix_now(),
    })
}

/// Send an in-memory blob as one complete transfer.
pub async fn send_blob<W>(
    writer: &mut W,
    transfer_id: &str,
    kind: FileKind,
    file_name: &str,
    data: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let start = start_message(transfer_id, kind, file_name, data.len() as u64);
    let total_chunks = start.total_chunks;
    write_frame(writer, &Envelope::StartTransfer(start)).await?;
    for index in 0..total_chunks {
        let from = (index * CHUNK_SIZE) as usize;
        let to = min(from + CHUNK_SIZE as usize, data.len());
        let chunk = chunk_message(transfer_id, index, &data[from..to]);
        trace!("transfer {transfer_id}: sending chunk {index}/{total_chunks}");
        write_frame(writer, &Envelope::DataChunk(chunk)).await?;
    }
    write_frame(writer, &end_message(transfer_id, TransferStatus::Success)).await?;
    debug!("transfer {transfer_id}: sent {file_name} ({} bytes)", data.len());
    Ok(())
}

/// Send a file from disk, chunk by chunk. A read error mid-transfer sends a
/// best-effort cancelled end-status instead of a success one.
pub async fn send_file<W>(
    writer: &mut W,
    transfer_id: &str,
    kind: FileKind,
    path: &Path,
) -> Result<TransferStatus, WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = std::fs::File::open(path)?;
    let total_size = file.metadata()?.len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let start = start_message(transfer_id, kind, &file_name, total_size);
    let total_chunks = start.total_chunks;
    write_frame(writer, &Envelope::StartTransfer(start)).await?;

    let mut sent = 0u64;
    for index in 0..total_chunks {
        let want = min(CHUNK_SIZE, total_size - sent) as usize;
        let mut buf = vec![0u8; want];
        if let Err(e) = file.read_exact(&mut buf) {
            warn!("transfer {transfer_id}: reading {} failed: {e}", path.display());
            let _ = write_frame(writer, &end_message(transfer_id, TransferStatus::Cancelled))
                .await;
            return Ok(TransferStatus::Cancelled);
        }
        write_frame(writer, &Envelope::DataChunk(chunk_message(transfer_id, index, &buf)))
            .await?;
        sent += want as u64;
    }
    write_frame(writer, &end_message(transfer_id, TransferStatus::Success)).await?;
    debug!("transfer {transfer_id}: sent {file_name} ({sent} bytes)");
    Ok(TransferStatus::Success)
}

/// Accumulator for the single open transfer on a connection.
pub struct PendingTransfer {
    pub transfer_id: String,
    pub kind: FileKind,
    pub file_name: String,
    total_chunks: u64,
    chunks_received: u64,
    data: Vec<u8>,
}

/// What `PendingTransfer::accept` did with a chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    /// The chunk named some other transfer_id; the open transfer is
    /// untouched.
    IgnoredForeign,
}

impl PendingTransfer {
    pub fn new(start: &StartTransfer) -> Self {
        PendingTransfer {
            transfer_id: start.transfer_id.clone(),
            kind: start.file_type,
            file_name: start.file_name.clone(),
            total_chunks: start.total_chunks,
            chunks_received: 0,
            data: Vec::with_capacity(start.total_size as usize),
        }
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    /// Strict in-order accumulation. A foreign transfer_id is ignored; a
    /// wrong index or undecodable payload is an abort.
    pub fn accept(&mut self, chunk: &DataChunk) -> Result<ChunkOutcome, TransferError> {
        if chunk.transfer_id != self.transfer_id {
            return Ok(ChunkOutcome::IgnoredForeign);
        }
        if chunk.chunk_index != self.chunks_received {
            return Err(TransferError::OutOfOrder {
                expected: self.chunks_received,
                got: chunk.chunk_index,
            });
        }
        let bytes = STANDARD.decode(&chunk.data)?;
        self.data.extend_from_slice(&bytes);
        self.chunks_received += 1;
        Ok(ChunkOutcome::Accepted)
    }

    fn finish(self) -> CompletedTransfer {
        CompletedTransfer {
            kind: self.kind,
            file_name: self.file_name,
            data: self.data,
        }
    }
}

/// An assembled transfer awaiting its sink.
pub struct CompletedTransfer {
    pub kind: FileKind,
    pub file_name: String,
    pub data: Vec<u8>,
}

impl CompletedTransfer {
    /// Dispatch to the type-specific sink inside a client vault: directory
    /// snapshots merge into `data.json`, everything else lands under its
    /// media subdirectory.
    pub fn persist(&self, vault: &ClientVault) -> anyhow::Result<()> {
        match self.kind {
            FileKind::Directory => vault.apply_snapshot_bytes(&self.data),
            _ => vault
                .store_media(self.kind, &self.file_name, &self.data)
                .map(|_| ()),
        }
    }
}

/// Wait for a StartTransfer, skipping unrelated frames. With an expected
/// transfer_id, starts for other transfers are skipped too.
pub async fn await_start<R>(
    reader: &mut R,
    expected_id: Option<&str>,
) -> Result<StartTransfer, TransferError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(reader).await? {
            Envelope::StartTransfer(start) => {
                if expected_id.is_some_and(|id| id != start.transfer_id) {
                    warn!(
                        "skipping start for transfer {} while waiting for {}",
                        start.transfer_id,
                        expected_id.unwrap_or_default()
                    );
                    continue;
                }
                return Ok(start);
            }
            other => {
                warn!("ignoring message tag {} while awaiting transfer", other.tag());
            }
        }
    }
}

/// Drive the receiver side after its StartTransfer has been read. Returns
/// the assembled transfer on a success end-status, `None` on cancellation.
/// Any abort discards the accumulator; nothing partial survives.
pub async fn receive<R>(
    reader: &mut R,
    start: &StartTransfer,
) -> Result<Option<CompletedTransfer>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut pending = PendingTransfer::new(start);
    debug!(
        "transfer {}: receiving {} ({} chunks)",
        pending.transfer_id, pending.file_name, pending.total_chunks
    );
    loop {
        match read_frame(reader).await? {
            Envelope::DataChunk(chunk) => match pending.accept(&chunk)? {
                ChunkOutcome::Accepted => {}
                ChunkOutcome::IgnoredForeign => {
                    warn!(
                        "transfer {}: ignoring chunk for unknown transfer {}",
                        pending.transfer_id, chunk.transfer_id
                    );
                }
            },
            Envelope::EndTransfer(end) => {
                if end.transfer_id != pending.transfer_id {
                    warn!(
                        "transfer {}: ignoring end for unknown transfer {}",
                        pending.transfer_id, end.transfer_id
                    );
                    continue;
                }
                return match end.status {
                    TransferStatus::Success => Ok(Some(pending.finish())),
                    TransferStatus::Cancelled => {
                        warn!("transfer {} cancelled by sender", pending.transfer_id);
                        Ok(None)
                    }
                };
            }
            Envelope::StartTransfer(restart) => {
                // A new start supersedes the open transfer.
                warn!(
                    "transfer {} superseded by {}",
                    pending.transfer_id, restart.transfer_id
                );
                pending = PendingTransfer::new(&restart);
            }
            other => return Err(TransferError::UnexpectedMessage(other.tag())),
        }
    }
}
