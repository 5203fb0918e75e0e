//! Streaming decoder for the OSM PBF container format.
//!
//! The input is a bounded channel of raw byte chunks filled by whatever
//! reads the actual file or socket. A framer thread pulls chunks, splits
//! the stream into blobs and hands each data blob to a worker on the rayon
//! pool. Results travel through one-shot slots that the framer enqueues in
//! arrival order, so the consumer sees entity buffers in exact stream order
//! no matter how the decoding is scheduled.
//!
//! ```text
//! bytes ──> framer ──> [slot, slot, slot, ...] ──> PbfReader::read()
//!              \          ^ filled by rayon workers
//!               `──> header (one-shot)
//! ```

pub mod proto;

mod decoder;

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ByteOrder, NetworkEndian};
use log::{debug, trace};
use parking_lot::Mutex;
use prost::Message;

use crate::buffer::EntityBuffer;
use crate::entity::EntityFilter;
use crate::error::{Error, Result};
use crate::header::Header;

/// Maximal size of a BlobHeader message.
pub const MAX_BLOB_HEADER_SIZE: u32 = 64 * 1024;

/// Maximal size of an uncompressed blob payload.
pub const MAX_UNCOMPRESSED_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Bound of the result queue; applies backpressure on the framer when the
/// consumer falls behind the decoders.
const MAX_QUEUE_SIZE: usize = 32;

/// Checks the environment knob selecting whether data blobs are decoded on
/// the rayon pool or synchronously on the framer thread. Decoding in the
/// framer is slower but can simplify profiling; the output is identical.
fn use_pool_threads() -> bool {
    match std::env::var("OSMSTREAM_USE_POOL_THREADS") {
        Ok(value) => !matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => true,
    }
}

/// What a slot resolves to: a decoded data blob or the end-of-stream
/// marker. The marker is distinct from an empty buffer because a data blob
/// can legitimately decode to nothing when an entity filter is active.
enum Decoded {
    Data(EntityBuffer),
    Eof,
}

type BlobResult = Result<Decoded>;

/// One-shot slot that will eventually hold the result of decoding a single
/// blob.
struct ResultSlot(Receiver<BlobResult>);

/// Decoder for a PBF byte stream.
///
/// Reading is pull-based: [`PbfReader::read`] blocks until the next buffer
/// in stream order is decoded and returns an empty buffer at the end of the
/// input. Once any call returned an error the stream is dead; every
/// following call reports the same error.
pub struct PbfReader {
    results: Receiver<ResultSlot>,
    header_rx: Receiver<Header>,
    header: Option<Header>,
    status: Arc<Mutex<Option<Error>>>,
    framer: Option<JoinHandle<()>>,
    eof: bool,
}

impl PbfReader {
    /// Starts decoding the byte-chunk stream `input`, delivering all entity
    /// kinds.
    ///
    /// An empty chunk or a dropped sender signals the end of the input.
    pub fn new(input: Receiver<Vec<u8>>) -> Self {
        Self::with_filter(input, EntityFilter::ALL)
    }

    /// Like [`PbfReader::new`] but only decodes the entity kinds selected
    /// by `filter`.
    pub fn with_filter(input: Receiver<Vec<u8>>, filter: EntityFilter) -> Self {
        let (results_tx, results_rx) = sync_channel(MAX_QUEUE_SIZE);
        let (header_tx, header_rx) = sync_channel(1);
        let status = Arc::new(Mutex::new(None));

        let framer = Framer {
            input,
            accumulator: Vec::new(),
            results: results_tx,
            header: Some(header_tx),
            status: status.clone(),
            filter,
            use_threads: use_pool_threads(),
        };
        let handle = std::thread::Builder::new()
            .name("osmstream-pbf-framer".into())
            .spawn(move || framer.run())
            .expect("failed to spawn PBF framer thread");

        Self {
            results: results_rx,
            header_rx,
            header: None,
            status,
            framer: Some(handle),
            eof: false,
        }
    }

    fn check_status(&self) -> Result<()> {
        match self.status.lock().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn record_status(&self, error: &Error) {
        let mut status = self.status.lock();
        if status.is_none() {
            *status = Some(error.clone());
        }
    }

    /// Returns the stream header. Blocks until the framer decoded it, which
    /// happens before any data blob is dispatched.
    pub fn header(&mut self) -> Result<Header> {
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }
        match self.header_rx.recv() {
            Ok(header) => {
                self.check_status()?;
                self.header = Some(header.clone());
                Ok(header)
            }
            Err(_) => {
                self.check_status()?;
                Err(Error::pbf("header missing"))
            }
        }
    }

    /// Returns the next entity buffer in stream order, blocking until it is
    /// decoded. An empty buffer signals the end of the stream.
    ///
    /// Blobs whose entities were all excluded by the filter are skipped, so
    /// a non-empty result is guaranteed until the stream ends.
    pub fn read(&mut self) -> Result<EntityBuffer> {
        self.check_status()?;
        if self.eof {
            return Ok(EntityBuffer::new());
        }

        loop {
            let slot = match self.results.recv() {
                Ok(slot) => slot,
                Err(_) => {
                    self.check_status()?;
                    return Err(Error::pbf("parser thread terminated unexpectedly"));
                }
            };
            match slot.0.recv() {
                Ok(Ok(Decoded::Data(buffer))) if buffer.is_empty() => continue,
                Ok(Ok(Decoded::Data(buffer))) => return Ok(buffer),
                Ok(Ok(Decoded::Eof)) => {
                    self.eof = true;
                    return Ok(EntityBuffer::new());
                }
                Ok(Err(error)) => {
                    self.record_status(&error);
                    return Err(error);
                }
                Err(_) => {
                    let error = Error::pbf("blob decoder task failed");
                    self.record_status(&error);
                    return Err(error);
                }
            }
        }
    }

    /// Shuts the pipeline down: drains pending results, discards them and
    /// joins the framer thread. Safe to call any number of times, never
    /// fails.
    pub fn close(&mut self) {
        // dropping the receivers unblocks a framer stuck on a full queue
        let (_dead_tx, dead_rx) = sync_channel(1);
        drop(std::mem::replace(&mut self.results, dead_rx));
        let (_dead_tx, dead_rx) = sync_channel(1);
        drop(std::mem::replace(&mut self.header_rx, dead_rx));

        if let Some(handle) = self.framer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PbfReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// The stage that owns the input: accumulates chunks, splits the stream
/// into `{BlobHeader, Blob}` frames and dispatches data blobs for decoding.
struct Framer {
    input: Receiver<Vec<u8>>,
    accumulator: Vec<u8>,
    results: SyncSender<ResultSlot>,
    header: Option<SyncSender<Header>>,
    status: Arc<Mutex<Option<Error>>>,
    filter: EntityFilter,
    use_threads: bool,
}

impl Framer {
    fn run(mut self) {
        if let Err(error) = self.run_inner() {
            debug!("PBF framer failed: {error}");
            let mut status = self.status.lock();
            if status.is_none() {
                *status = Some(error.clone());
            }
            drop(status);

            // fulfill the header promise so a blocked header() call wakes up
            if let Some(tx) = self.header.take() {
                let _ = tx.send(Header::default());
            }
            // poison the queue: the consumer sees the error in stream order
            let (tx, rx) = sync_channel(1);
            let _ = tx.send(Err(error));
            let _ = self.results.send(ResultSlot(rx));
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        let header_size = self.check_type_and_get_blob_size("OSMHeader")?;
        let header = if header_size == 0 {
            // empty input: an empty stream with a default header
            Header::default()
        } else {
            let data = self.read_from_input(header_size)?;
            decoder::decode_header(&data)?
        };
        if let Some(tx) = self.header.take() {
            let _ = tx.send(header);
        }
        debug!("PBF header decoded");

        if !self.filter.is_empty() && header_size != 0 {
            let mut blob_count = 0u64;
            loop {
                let size = self.check_type_and_get_blob_size("OSMData")?;
                if size == 0 {
                    break;
                }
                let data = self.read_from_input(size)?;
                if data.len() > MAX_UNCOMPRESSED_BLOB_SIZE {
                    return Err(Error::pbf(format!("invalid blob size: {}", data.len())));
                }

                let (tx, rx) = sync_channel(1);
                if self.results.send(ResultSlot(rx)).is_err() {
                    // consumer closed the reader, stop quietly
                    return Ok(());
                }
                trace!("dispatching data blob {blob_count} ({} bytes)", data.len());
                blob_count += 1;

                let filter = self.filter;
                if self.use_threads {
                    rayon::spawn(move || {
                        let _ = tx.send(decoder::decode_data_blob(&data, filter).map(Decoded::Data));
                    });
                } else {
                    let _ = tx.send(decoder::decode_data_blob(&data, filter).map(Decoded::Data));
                }
            }
            debug!("PBF stream complete after {blob_count} data blobs");
        }

        let (tx, rx) = sync_channel(1);
        let _ = tx.send(Ok(Decoded::Eof));
        let _ = self.results.send(ResultSlot(rx));
        Ok(())
    }

    /// Pulls chunks until `size` bytes are buffered, then splits them off.
    fn read_from_input(&mut self, size: usize) -> Result<Vec<u8>> {
        while self.accumulator.len() < size {
            match self.input.recv() {
                Ok(chunk) if !chunk.is_empty() => self.accumulator.extend_from_slice(&chunk),
                // empty chunk or closed channel: end of input
                _ => return Err(Error::pbf("truncated data (EOF encountered)")),
            }
        }
        let rest = self.accumulator.split_off(size);
        Ok(std::mem::replace(&mut self.accumulator, rest))
    }

    /// Reads the 4-byte network-order length of the next BlobHeader.
    /// Returns 0 at a clean end of the input.
    fn read_blob_header_size(&mut self) -> Result<u32> {
        let bytes = match self.read_from_input(4) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(0), // EOF
        };
        let size = NetworkEndian::read_u32(&bytes);
        if size > MAX_BLOB_HEADER_SIZE {
            return Err(Error::pbf("invalid BlobHeader size (> max_blob_header_size)"));
        }
        Ok(size)
    }

    /// Decodes the next BlobHeader, making sure it announces the expected
    /// blob type, and returns the size of the following blob. Returns 0 at
    /// a clean end of the input.
    fn check_type_and_get_blob_size(&mut self, expected_type: &str) -> Result<usize> {
        let size = self.read_blob_header_size()?;
        if size == 0 {
            return Ok(0);
        }

        let bytes = self.read_from_input(size as usize)?;
        let blob_header = proto::BlobHeader::decode(bytes.as_slice())
            .map_err(|e| Error::pbf(format!("invalid BlobHeader: {e}")))?;

        if blob_header.datasize <= 0 {
            return Err(Error::pbf("BlobHeader.datasize missing or zero"));
        }
        if blob_header.r#type != expected_type {
            return Err(Error::pbf(
                "blob does not have expected type (OSMHeader in first blob, OSMData in following blobs)",
            ));
        }
        Ok(blob_header.datasize as usize)
    }
}
