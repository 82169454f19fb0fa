use crate::error::SplatError;
use crate::geom::CameraPose;
use crate::sort::{CameraDepth, DepthMode, PrecomputedDepth, SortConfig, SortDirection, SplatSorter};
use crate::store::SplatStore;
use glam::Vec3;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FLAG_INTEGER_DEPTH: u16 = 1 << 0;
pub const FLAG_PRECOMPUTED: u16 = 1 << 1;
pub const FLAG_INLINE_POSITIONS: u16 = 1 << 2;
pub const FLAG_INLINE_ALPHAS: u16 = 1 << 3;
pub const FLAG_FRONT_TO_BACK: u16 = 1 << 4;
pub const FLAG_ALL_CANDIDATES: u16 = 1 << 5;
pub const FLAG_REQUIRE_INTEGER: u16 = 1 << 6;
pub const FLAG_ALPHA_FILTER: u16 = 1 << 7;

pub const STATUS_OK: u32 = 0;
pub const STATUS_STALE_GENERATION: u32 = 1;
pub const STATUS_ERROR: u32 = 2;

/// Fixed binary layout of one sort request frame. The header is followed
/// by the candidate indices (unless `FLAG_ALL_CANDIDATES`), the
/// precomputed depth array (`FLAG_PRECOMPUTED`, global-indexed), the
/// inline candidate positions (`FLAG_INLINE_POSITIONS`, copied channel)
/// and the inline candidate opacities (`FLAG_INLINE_ALPHAS`).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct RequestHeader {
    pub seq: u64,
    pub generation: u64,
    pub cam_position: [f32; 3],
    pub cam_forward: [f32; 3],
    pub candidate_count: u32,
    pub flags: u16,
    pub precision_bits: u8,
    pub alpha_threshold: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ResponseHeader {
    pub seq: u64,
    pub generation: u64,
    pub count: u32,
    pub status: u32,
}

/// How splat positions reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// The position/opacity columns are published once per structural
    /// change and shared with the worker without copying.
    Shared,
    /// Candidate positions travel inside every request frame. The hybrid
    /// precomputed-depth path is rejected here; shipping a device-computed
    /// array through a copying channel costs more than it saves.
    Copied,
}

#[derive(Debug, Clone, Copy)]
pub enum Candidates<'a> {
    All,
    Subset(&'a [u32]),
}

/// One sort request as seen by the caller; `submit` turns it into a wire
/// frame.
#[derive(Debug, Clone, Copy)]
pub struct SortRequest<'a> {
    pub pose: CameraPose,
    pub candidates: Candidates<'a>,
    /// Device-computed depth per splat, global-indexed (shared mode only).
    pub precomputed_depths: Option<&'a [f32]>,
    /// Candidate positions, xyz per candidate (copied mode only).
    pub inline_positions: Option<&'a [f32]>,
    /// Candidate opacities (copied mode only).
    pub inline_alphas: Option<&'a [u8]>,
}

impl<'a> SortRequest<'a> {
    pub fn new(pose: CameraPose, candidates: Candidates<'a>) -> Self {
        Self {
            pose,
            candidates,
            precomputed_depths: None,
            inline_positions: None,
            inline_alphas: None,
        }
    }
}

/// Decoded response frame.
#[derive(Debug, Clone)]
pub struct SortResult {
    pub seq: u64,
    pub generation: u64,
    pub status: u32,
    pub ordering: Vec<u32>,
}

/// Consumer-side staleness gate: responses may arrive out of request
/// order, so anything at or below the last applied sequence number is
/// discarded silently.
#[derive(Debug, Default)]
pub struct ResultGate {
    last_applied: u64,
}

impl ResultGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, result: SortResult) -> Option<Vec<u32>> {
        if result.status != STATUS_OK || result.seq <= self.last_applied {
            return None;
        }
        self.last_applied = result.seq;
        Some(result.ordering)
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }
}

enum WorkerMessage {
    Publish {
        generation: u64,
        positions: Arc<[f32]>,
        opacities: Arc<[u8]>,
    },
    Request(Vec<u8>),
    Shutdown,
}

/// Sort engine isolated on its own thread so a pass never blocks frame
/// submission. Requests and responses are binary frames; a newer request
/// supersedes any queued older one (latest camera wins).
pub struct SortWorker {
    mode: ChannelMode,
    config: SortConfig,
    tx: mpsc::Sender<WorkerMessage>,
    rx: mpsc::Receiver<Vec<u8>>,
    handle: Option<thread::JoinHandle<()>>,
    next_seq: u64,
    published_generation: u64,
}

impl SortWorker {
    pub fn spawn(mode: ChannelMode, config: SortConfig) -> Result<Self, SplatError> {
        let (tx, worker_rx) = mpsc::channel::<WorkerMessage>();
        let (worker_tx, rx) = mpsc::channel::<Vec<u8>>();
        let handle = thread::Builder::new()
            .name("splat-sort".to_string())
            .spawn(move || worker_loop(worker_rx, worker_tx))
            .map_err(SplatError::IoError)?;
        Ok(Self {
            mode,
            config,
            tx,
            rx,
            handle: Some(handle),
            next_seq: 0,
            published_generation: 0,
        })
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Shares the store's position and opacity columns with the worker.
    /// Called once per structural change, never per frame.
    pub fn publish_store(&mut self, store: &SplatStore) -> Result<(), SplatError> {
        if self.mode != ChannelMode::Shared {
            return Ok(());
        }
        self.published_generation = store.generation();
        self.tx
            .send(WorkerMessage::Publish {
                generation: store.generation(),
                positions: Arc::from(store.positions()),
                opacities: Arc::from(store.opacities()),
            })
            .map_err(|_| SplatError::WorkerDisconnected)
    }

    /// Encodes and enqueues one request; returns its sequence number.
    pub fn submit(&mut self, request: &SortRequest) -> Result<u64, SplatError> {
        let frame = self.encode_request(request)?;
        self.tx
            .send(WorkerMessage::Request(frame))
            .map_err(|_| SplatError::WorkerDisconnected)?;
        Ok(self.next_seq)
    }

    fn encode_request(&mut self, request: &SortRequest) -> Result<Vec<u8>, SplatError> {
        if self.mode == ChannelMode::Copied && request.precomputed_depths.is_some() {
            return Err(SplatError::MalformedInput(
                "hybrid depth precompute requires the shared position channel".to_string(),
            ));
        }
        let inline_positions = match self.mode {
            ChannelMode::Copied => Some(request.inline_positions.ok_or_else(|| {
                SplatError::MalformedInput(
                    "copied-channel request without inline positions".to_string(),
                )
            })?),
            ChannelMode::Shared => None,
        };

        let mut flags = 0u16;
        if self.config.depth_mode == DepthMode::Integer {
            flags |= FLAG_INTEGER_DEPTH;
        }
        if self.config.direction == SortDirection::FrontToBack {
            flags |= FLAG_FRONT_TO_BACK;
        }
        if self.config.require_integer {
            flags |= FLAG_REQUIRE_INTEGER;
        }
        if request.precomputed_depths.is_some() {
            flags |= FLAG_PRECOMPUTED;
        }
        if inline_positions.is_some() {
            flags |= FLAG_INLINE_POSITIONS;
        }
        if inline_positions.is_some() && request.inline_alphas.is_some() {
            flags |= FLAG_INLINE_ALPHAS;
        }
        let alpha_threshold = match self.config.alpha_threshold {
            Some(t) => {
                flags |= FLAG_ALPHA_FILTER;
                t
            }
            None => 0,
        };

        let candidate_count = match request.candidates {
            Candidates::All => {
                flags |= FLAG_ALL_CANDIDATES;
                match inline_positions {
                    Some(positions) => (positions.len() / 3) as u32,
                    None => 0,
                }
            }
            Candidates::Subset(indices) => indices.len() as u32,
        };
        if let Some(positions) = inline_positions {
            if positions.len() != candidate_count as usize * 3 {
                return Err(SplatError::MalformedInput(
                    "inline position payload does not match the candidate count".to_string(),
                ));
            }
            if let Some(alphas) = request.inline_alphas {
                if alphas.len() != candidate_count as usize {
                    return Err(SplatError::MalformedInput(
                        "inline alpha payload does not match the candidate count".to_string(),
                    ));
                }
            }
        }

        self.next_seq += 1;
        let header = RequestHeader {
            seq: self.next_seq,
            generation: self.published_generation,
            cam_position: request.pose.position.to_array(),
            cam_forward: request.pose.forward.to_array(),
            candidate_count,
            flags,
            precision_bits: self.config.precision_bits,
            alpha_threshold,
        };

        let mut frame = Vec::with_capacity(std::mem::size_of::<RequestHeader>());
        frame.extend_from_slice(header.as_bytes());
        if let Candidates::Subset(indices) = request.candidates {
            frame.extend_from_slice(bytemuck::cast_slice(indices));
        }
        if let Some(depths) = request.precomputed_depths {
            frame.extend_from_slice(&(depths.len() as u32).to_le_bytes());
            frame.extend_from_slice(bytemuck::cast_slice(depths));
        }
        if let Some(positions) = inline_positions {
            frame.extend_from_slice(bytemuck::cast_slice(positions));
            if let Some(alphas) = request.inline_alphas {
                frame.extend_from_slice(alphas);
            }
        }
        Ok(frame)
    }

    /// Non-blocking poll for the next response frame.
    pub fn try_result(&mut self) -> Option<SortResult> {
        self.rx.try_recv().ok().and_then(|f| decode_response(&f))
    }

    /// Blocking receive, used by callers that synchronize on a pass.
    pub fn recv_result(&mut self) -> Result<SortResult, SplatError> {
        let frame = self.rx.recv().map_err(|_| SplatError::WorkerDisconnected)?;
        decode_response(&frame).ok_or_else(|| {
            SplatError::MalformedInput("undersized response frame from the sort worker".to_string())
        })
    }
}

impl Drop for SortWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn decode_response(frame: &[u8]) -> Option<SortResult> {
    let (header, rest) = ResponseHeader::read_from_prefix(frame).ok()?;
    let count = header.count as usize;
    if rest.len() < count * 4 {
        return None;
    }
    let ordering = rest[..count * 4]
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Some(SortResult {
        seq: header.seq,
        generation: header.generation,
        status: header.status,
        ordering,
    })
}

struct WorkerState {
    generation: u64,
    positions: Arc<[f32]>,
    opacities: Arc<[u8]>,
}

fn worker_loop(rx: mpsc::Receiver<WorkerMessage>, tx: mpsc::Sender<Vec<u8>>) {
    let mut sorter = SplatSorter::new(SortConfig::default());
    let mut state = WorkerState {
        generation: 0,
        positions: Arc::from(Vec::new()),
        opacities: Arc::from(Vec::new()),
    };

    loop {
        let Ok(first) = rx.recv() else {
            return;
        };
        // Drain the queue so only the newest request is served; stale
        // camera states are dropped before any work happens on them.
        let mut request = None;
        let mut shutdown = false;
        for msg in std::iter::once(first).chain(std::iter::from_fn(|| rx.try_recv().ok())) {
            match msg {
                WorkerMessage::Publish {
                    generation,
                    positions,
                    opacities,
                } => {
                    state.generation = generation;
                    state.positions = positions;
                    state.opacities = opacities;
                }
                WorkerMessage::Request(frame) => request = Some(frame),
                WorkerMessage::Shutdown => shutdown = true,
            }
        }
        if let Some(frame) = request {
            let response = serve(&mut sorter, &state, &frame);
            if tx.send(response).is_err() {
                return;
            }
        }
        if shutdown {
            return;
        }
    }
}

fn serve(sorter: &mut SplatSorter, state: &WorkerState, frame: &[u8]) -> Vec<u8> {
    match sort_frame(sorter, state, frame) {
        Ok(response) => response,
        Err((seq, e)) => {
            tracing::warn!(error = %e, "sort request failed; previous ordering stays in effect");
            encode_response(seq, state.generation, STATUS_ERROR, &[])
        }
    }
}

fn sort_frame(
    sorter: &mut SplatSorter,
    state: &WorkerState,
    frame: &[u8],
) -> Result<Vec<u8>, (u64, SplatError)> {
    let (header, mut rest) = RequestHeader::read_from_prefix(frame)
        .map_err(|_| (0, SplatError::MalformedInput("undersized request frame".to_string())))?;
    let seq = header.seq;
    let fail = |e: SplatError| (seq, e);

    sorter.set_config(SortConfig {
        direction: if header.flags & FLAG_FRONT_TO_BACK != 0 {
            SortDirection::FrontToBack
        } else {
            SortDirection::BackToFront
        },
        depth_mode: if header.flags & FLAG_INTEGER_DEPTH != 0 {
            DepthMode::Integer
        } else {
            DepthMode::Float
        },
        precision_bits: header.precision_bits,
        alpha_threshold: (header.flags & FLAG_ALPHA_FILTER != 0).then_some(header.alpha_threshold),
        require_integer: header.flags & FLAG_REQUIRE_INTEGER != 0,
    });

    let pose = CameraPose::new(
        Vec3::from_array(header.cam_position),
        Vec3::from_array(header.cam_forward),
    );
    let inline = header.flags & FLAG_INLINE_POSITIONS != 0;

    // Candidate list.
    let mut explicit = Vec::new();
    if header.flags & FLAG_ALL_CANDIDATES == 0 {
        let bytes = take(&mut rest, header.candidate_count as usize * 4, seq)?;
        explicit.extend(
            bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
    }

    // Precomputed depths (global-indexed, shared channel only).
    let mut depths = Vec::new();
    if header.flags & FLAG_PRECOMPUTED != 0 {
        let b = take(&mut rest, 4, seq)?;
        let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
        let bytes = take(&mut rest, len * 4, seq)?;
        depths.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
    }

    // Copied-channel payloads.
    let mut inline_positions = Vec::new();
    let mut inline_alphas = Vec::new();
    if inline {
        let bytes = take(&mut rest, header.candidate_count as usize * 12, seq)?;
        inline_positions.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        if header.flags & FLAG_INLINE_ALPHAS != 0 {
            inline_alphas = take(&mut rest, header.candidate_count as usize, seq)?.to_vec();
        }
    }

    let (positions, opacities): (&[f32], &[u8]) = if inline {
        (&inline_positions, &inline_alphas)
    } else {
        if header.generation != state.generation {
            return Ok(encode_response(seq, state.generation, STATUS_STALE_GENERATION, &[]));
        }
        (&state.positions, &state.opacities)
    };

    let all: Vec<u32>;
    let candidates: &[u32] = if header.flags & FLAG_ALL_CANDIDATES != 0 {
        all = (0..(positions.len() / 3) as u32).collect();
        &all
    } else {
        &explicit
    };
    let splat_count = (positions.len() / 3) as u32;
    if candidates.iter().any(|&i| i >= splat_count) {
        return Err(fail(SplatError::MalformedInput(
            "candidate index past the end of the position buffer".to_string(),
        )));
    }
    if header.flags & FLAG_PRECOMPUTED != 0 && depths.len() < splat_count as usize {
        return Err(fail(SplatError::MalformedInput(
            "precomputed depth array shorter than the splat count".to_string(),
        )));
    }
    let opacities = (!opacities.is_empty()).then_some(opacities);

    // In copied mode the worker sorts over its local snapshot, so explicit
    // candidate labels index the inline payload, not the caller's store.
    let ordering = if header.flags & FLAG_PRECOMPUTED != 0 {
        sorter.sort(&PrecomputedDepth::new(&depths), &pose, candidates, opacities)
    } else {
        sorter.sort(&CameraDepth::new(positions), &pose, candidates, opacities)
    }
    .map_err(fail)?;

    Ok(encode_response(seq, header.generation, STATUS_OK, &ordering))
}

fn take<'a>(rest: &mut &'a [u8], len: usize, seq: u64) -> Result<&'a [u8], (u64, SplatError)> {
    if rest.len() < len {
        return Err((
            seq,
            SplatError::MalformedInput(format!(
                "request frame truncated, need {} more bytes, have {}",
                len,
                rest.len()
            )),
        ));
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

fn encode_response(seq: u64, generation: u64, status: u32, ordering: &[u32]) -> Vec<u8> {
    let header = ResponseHeader {
        seq,
        generation,
        count: ordering.len() as u32,
        status,
    };
    let mut frame = Vec::with_capacity(std::mem::size_of::<ResponseHeader>() + ordering.len() * 4);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(bytemuck::cast_slice(ordering));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SectionData;

    fn line_store(depths: &[f32]) -> SplatStore {
        let mut data = SectionData::with_capacity(depths.len(), 0);
        for &z in depths {
            data.push_splat(
                [0.0, 0.0, z],
                [0.1; 3],
                [0.0, 0.0, 0.0, 1.0],
                [255, 255, 255, 255],
                &[],
            );
        }
        let mut store = SplatStore::new(0);
        store.append_section(data).expect("append");
        store
    }

    fn pose() -> CameraPose {
        CameraPose::new(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, -1.0))
    }

    #[test]
    fn shared_channel_sorts_back_to_front() {
        let store = line_store(&[0.0, 8.0, 4.0, -6.0]);
        let mut worker = SortWorker::spawn(ChannelMode::Shared, SortConfig::default()).expect("spawn");
        worker.publish_store(&store).expect("publish");
        worker
            .submit(&SortRequest::new(pose(), Candidates::All))
            .expect("submit");
        let result = worker.recv_result().expect("result");
        assert_eq!(result.status, STATUS_OK);
        // Depth from z=10 looking down -z: farthest first.
        assert_eq!(result.ordering, vec![3, 0, 2, 1]);
    }

    #[test]
    fn stale_generation_is_reported_not_sorted() {
        let mut store = line_store(&[0.0, 1.0]);
        let mut worker = SortWorker::spawn(ChannelMode::Shared, SortConfig::default()).expect("spawn");
        worker.publish_store(&store).expect("publish");

        let mut extra = SectionData::with_capacity(1, 0);
        extra.push_splat([0.0; 3], [0.1; 3], [0.0, 0.0, 0.0, 1.0], [0, 0, 0, 255], &[]);
        store.append_section(extra).expect("append");
        // Worker still holds the old snapshot; pretend the caller raced.
        worker.published_generation = store.generation();
        worker
            .submit(&SortRequest::new(pose(), Candidates::All))
            .expect("submit");
        let result = worker.recv_result().expect("result");
        assert_eq!(result.status, STATUS_STALE_GENERATION);
        assert!(ResultGate::new().accept(result).is_none());
    }

    #[test]
    fn copied_channel_sorts_inline_payload() {
        let positions = [0.0f32, 0.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 4.0];
        let mut worker = SortWorker::spawn(ChannelMode::Copied, SortConfig::default()).expect("spawn");
        let mut request = SortRequest::new(pose(), Candidates::All);
        request.inline_positions = Some(&positions);
        worker.submit(&request).expect("submit");
        let result = worker.recv_result().expect("result");
        assert_eq!(result.status, STATUS_OK);
        assert_eq!(result.ordering, vec![0, 2, 1]);
    }

    #[test]
    fn hybrid_path_is_rejected_on_the_copied_channel() {
        let depths = [1.0f32, 2.0];
        let mut worker = SortWorker::spawn(ChannelMode::Copied, SortConfig::default()).expect("spawn");
        let mut request = SortRequest::new(pose(), Candidates::All);
        request.precomputed_depths = Some(&depths);
        let err = worker.submit(&request).expect_err("must reject");
        assert!(matches!(err, SplatError::MalformedInput(_)));
    }

    #[test]
    fn precomputed_depths_drive_the_shared_channel() {
        let store = line_store(&[0.0, 0.0, 0.0]);
        let mut worker = SortWorker::spawn(ChannelMode::Shared, SortConfig::default()).expect("spawn");
        worker.publish_store(&store).expect("publish");
        let depths = [5.0f32, 1.0, 3.0];
        let mut request = SortRequest::new(pose(), Candidates::All);
        request.precomputed_depths = Some(&depths);
        worker.submit(&request).expect("submit");
        let result = worker.recv_result().expect("result");
        assert_eq!(result.ordering, vec![0, 2, 1]);
    }

    #[test]
    fn gate_discards_out_of_order_responses() {
        let mut gate = ResultGate::new();
        let newer = SortResult {
            seq: 2,
            generation: 1,
            status: STATUS_OK,
            ordering: vec![1, 0],
        };
        let older = SortResult {
            seq: 1,
            generation: 1,
            status: STATUS_OK,
            ordering: vec![0, 1],
        };
        assert_eq!(gate.accept(newer).expect("apply newer"), vec![1, 0]);
        assert!(gate.accept(older).is_none(), "older response must be discarded");
        assert_eq!(gate.last_applied(), 2);
    }

    #[test]
    fn subset_candidates_restrict_the_ordering() {
        let store = line_store(&[0.0, 8.0, 4.0, 2.0]);
        let mut worker = SortWorker::spawn(ChannelMode::Shared, SortConfig::default()).expect("spawn");
        worker.publish_store(&store).expect("publish");
        let subset = [1u32, 3];
        worker
            .submit(&SortRequest::new(pose(), Candidates::Subset(&subset)))
            .expect("submit");
        let result = worker.recv_result().expect("result");
        assert_eq!(result.ordering, vec![3, 1]);
    }
}
