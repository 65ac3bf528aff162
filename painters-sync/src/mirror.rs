//! Client-side canvas mirror.
//!
//! ```text
//!          [MAP/SEND]            [MAP/END]
//!   IDLE ─────────────► SYNCING ───────────► READY
//!                          ▲                   │
//!                          └──── [MAP/SEND] ───┘
//! ```
//!
//! Chunks are applied strictly in sequence at the running byte count. An
//! out-of-order chunk is discarded and the missing id is requested once.
//! Pixel updates are absolute and always applied; the ones that arrive while
//! a frame is still being assembled are also replayed after every applied
//! chunk, so older chunk bytes never overwrite them.
//!
//! The reconciler does no I/O. [`Outcome::request`] carries the message the
//! transport should send back, if any.

use std::collections::HashSet;

use crate::canvas::BitCanvas;
use crate::chunk::DecodedChunk;
use crate::protocol::{CanvasInfo, ClientMessage, PixelUpdate, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    Idle,
    Syncing,
    Ready,
}

/// What a server message did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    SyncStarted,
    ChunkApplied {
        sequence_id: u32,
        bytes_received: usize,
    },
    /// A chunk arrived ahead of the expected one and was discarded.
    GapDetected { expected: u32, received: u32 },
    /// A full frame can be rendered. `complete` is false when chunks are
    /// still missing at the end marker.
    FrameReady { bytes_received: usize, complete: bool },
    PixelChanged { x: u32, y: u32, painted: bool },
    CanvasAnnounced { server: CanvasInfo, matches: bool },
    /// Same message as the previous one.
    Duplicate,
    /// Unparsable, out of range, or not valid in the current phase.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub event: MirrorEvent,
    /// Message to send back to the server.
    pub request: Option<ClientMessage>,
}

impl Outcome {
    fn event(event: MirrorEvent) -> Self {
        Self { event, request: None }
    }

    fn with_request(event: MirrorEvent, request: Option<ClientMessage>) -> Self {
        Self { event, request }
    }
}

pub struct MirrorReconciler {
    canvas: BitCanvas,
    phase: MirrorPhase,
    expected_sequence_id: u32,
    bytes_received: usize,
    /// Highest sequence id seen in this session, applied or not
    highest_seen: Option<u32>,
    /// Ids already asked for in this session
    requested: HashSet<u32>,
    /// Pixel updates seen while the frame is incomplete, in arrival order
    pending_pixels: Vec<PixelUpdate>,
    /// Set from the start marker until the frame is complete after the end marker
    collecting: bool,
    last_message: Option<ServerMessage>,
    frames_completed: u64,
}

impl MirrorReconciler {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: BitCanvas::new(width, height),
            phase: MirrorPhase::Idle,
            expected_sequence_id: 0,
            bytes_received: 0,
            highest_seen: None,
            requested: HashSet::new(),
            pending_pixels: Vec::new(),
            collecting: false,
            last_message: None,
            frames_completed: 0,
        }
    }

    /// Parse and apply one raw server frame, skipping exact repeats of the
    /// previous message.
    pub fn receive(&mut self, raw: &str) -> Outcome {
        let msg = match ServerMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping server message: {e}");
                return Outcome::event(MirrorEvent::Ignored);
            }
        };
        if self.last_message.as_ref() == Some(&msg) {
            log::trace!("Skipping repeated message {raw}");
            return Outcome::event(MirrorEvent::Duplicate);
        }
        self.last_message = Some(msg.clone());
        self.apply(msg)
    }

    /// Apply one parsed server message.
    pub fn apply(&mut self, msg: ServerMessage) -> Outcome {
        match msg {
            ServerMessage::SyncStart => self.start_sync(),
            ServerMessage::Chunk(chunk) => self.apply_chunk(chunk),
            ServerMessage::SyncEnd => self.end_sync(),
            ServerMessage::Pixel(update) => self.apply_pixel(update),
            ServerMessage::Canvas(info) => {
                let local = self.canvas_info();
                let matches = info == local;
                if !matches {
                    log::warn!(
                        "Server canvas is {}x{}, local mirror is {}x{}",
                        info.width,
                        info.height,
                        local.width,
                        local.height
                    );
                }
                Outcome::event(MirrorEvent::CanvasAnnounced { server: info, matches })
            }
        }
    }

    fn start_sync(&mut self) -> Outcome {
        self.phase = MirrorPhase::Syncing;
        self.canvas.clear();
        self.expected_sequence_id = 0;
        self.bytes_received = 0;
        self.highest_seen = None;
        self.requested.clear();
        self.pending_pixels.clear();
        self.collecting = true;
        log::debug!("Full sync started");
        Outcome::event(MirrorEvent::SyncStarted)
    }

    fn apply_chunk(&mut self, chunk: DecodedChunk) -> Outcome {
        if self.phase == MirrorPhase::Idle {
            return Outcome::event(MirrorEvent::Ignored);
        }
        let received = chunk.sequence_id;
        self.highest_seen = Some(self.highest_seen.map_or(received, |h| h.max(received)));

        if received < self.expected_sequence_id {
            return Outcome::event(MirrorEvent::Duplicate);
        }
        if received > self.expected_sequence_id {
            let expected = self.expected_sequence_id;
            log::debug!("Chunk gap: expected {expected}, got {received}");
            return Outcome::with_request(
                MirrorEvent::GapDetected { expected, received },
                self.request_missing(),
            );
        }

        if let Some(offset) = chunk.byte_offset {
            if offset != self.bytes_received {
                log::debug!(
                    "Chunk {received} claims offset {offset}, applying at {}",
                    self.bytes_received
                );
            }
        }
        let written = self.canvas.write_at(self.bytes_received, &chunk.bytes);
        self.bytes_received += written;
        self.expected_sequence_id += 1;
        self.replay_pending();

        // Chunks after this one were already seen and discarded
        let request = match self.highest_seen {
            Some(highest) if highest >= self.expected_sequence_id => self.request_missing(),
            _ => None,
        };

        if self.phase == MirrorPhase::Ready && self.is_complete() {
            self.finish_frame();
            return Outcome::with_request(
                MirrorEvent::FrameReady {
                    bytes_received: self.bytes_received,
                    complete: true,
                },
                request,
            );
        }
        Outcome::with_request(
            MirrorEvent::ChunkApplied {
                sequence_id: received,
                bytes_received: self.bytes_received,
            },
            request,
        )
    }

    fn end_sync(&mut self) -> Outcome {
        if self.phase != MirrorPhase::Syncing {
            return Outcome::event(MirrorEvent::Ignored);
        }
        self.phase = MirrorPhase::Ready;
        self.replay_pending();

        let complete = self.is_complete();
        let request = if complete {
            self.finish_frame();
            None
        } else {
            log::warn!(
                "Sync ended with {}/{} bytes",
                self.bytes_received,
                self.canvas.byte_len()
            );
            self.request_missing()
        };
        Outcome::with_request(
            MirrorEvent::FrameReady {
                bytes_received: self.bytes_received,
                complete,
            },
            request,
        )
    }

    fn apply_pixel(&mut self, update: PixelUpdate) -> Outcome {
        if !update.has_valid_color() || !self.canvas.contains(update.x, update.y) {
            return Outcome::event(MirrorEvent::Ignored);
        }
        self.canvas.set(update.x, update.y, update.is_painted());
        if self.collecting {
            self.pending_pixels.push(update);
        }
        Outcome::event(MirrorEvent::PixelChanged {
            x: update.x,
            y: update.y,
            painted: update.is_painted(),
        })
    }

    /// Resend request for the expected id, at most once per session.
    fn request_missing(&mut self) -> Option<ClientMessage> {
        let sequence_id = self.expected_sequence_id;
        self.requested
            .insert(sequence_id)
            .then_some(ClientMessage::Resend { sequence_id })
    }

    fn replay_pending(&mut self) {
        for update in &self.pending_pixels {
            self.canvas.set(update.x, update.y, update.is_painted());
        }
    }

    fn finish_frame(&mut self) {
        self.collecting = false;
        self.pending_pixels.clear();
        self.frames_completed += 1;
        log::debug!("Full frame assembled ({} bytes)", self.bytes_received);
    }

    fn is_complete(&self) -> bool {
        self.bytes_received >= self.canvas.byte_len()
    }

    /// Allow `sequence_id` to be requested again this session, e.g. when the
    /// earlier request never reached the server.
    pub fn forget_request(&mut self, sequence_id: u32) -> bool {
        self.requested.remove(&sequence_id)
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Flip a cell locally. Returns the update to send, or `None` when out of range.
    pub fn toggle_local(&mut self, x: u32, y: u32) -> Option<PixelUpdate> {
        let painted = self.canvas.toggle(x, y)?;
        Some(PixelUpdate::new(x, y, painted))
    }

    /// Set a cell locally. Returns the update to send, or `None` when out of range.
    pub fn set_local(&mut self, x: u32, y: u32, painted: bool) -> Option<PixelUpdate> {
        if !self.canvas.contains(x, y) {
            return None;
        }
        self.canvas.set(x, y, painted);
        Some(PixelUpdate::new(x, y, painted))
    }

    // ─── Read access ──────────────────────────────────────────────────

    /// Copy of the mirror for rendering.
    pub fn snapshot(&self) -> BitCanvas {
        self.canvas.clone()
    }

    pub fn canvas(&self) -> &BitCanvas {
        &self.canvas
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<bool> {
        self.canvas.contains(x, y).then(|| self.canvas.get(x, y))
    }

    pub fn canvas_info(&self) -> CanvasInfo {
        CanvasInfo {
            width: self.canvas.width(),
            height: self.canvas.height(),
        }
    }

    pub fn phase(&self) -> MirrorPhase {
        self.phase
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn expected_sequence_id(&self) -> u32 {
        self.expected_sequence_id
    }

    /// Whether a frame is still being assembled.
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{self, Chunk};

    /// 40x20 canvas: 100 bytes, 12-byte chunks at a 40-byte frame limit.
    const W: u32 = 40;
    const H: u32 = 20;

    fn source() -> BitCanvas {
        let mut canvas = BitCanvas::new(W, H);
        for i in 0..H {
            canvas.set(i * 2, i, true);
            canvas.set(W - 1 - i, i, true);
        }
        canvas
    }

    fn chunks(canvas: &BitCanvas) -> Vec<Chunk> {
        chunk::encode(canvas.raw_bytes(), 40).unwrap().collect()
    }

    fn requests(outcomes: &[Outcome]) -> Vec<ClientMessage> {
        outcomes.iter().filter_map(|o| o.request.clone()).collect()
    }

    #[test]
    fn test_forgotten_request_is_asked_again() {
        let all = chunks(&source());
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");

        let gap = mirror.receive(&all[1].to_wire());
        assert_eq!(gap.request, Some(ClientMessage::Resend { sequence_id: 0 }));
        // Suppressed while the first request is outstanding
        assert_eq!(mirror.receive(&all[2].to_wire()).request, None);

        assert!(mirror.forget_request(0));
        assert!(!mirror.forget_request(0));
        let end = mirror.receive("[MAP/END]");
        assert_eq!(end.request, Some(ClientMessage::Resend { sequence_id: 0 }));
    }

    #[test]
    fn test_full_sync_in_order() {
        let source = source();
        let mut mirror = MirrorReconciler::new(W, H);
        assert_eq!(mirror.phase(), MirrorPhase::Idle);

        assert_eq!(mirror.receive("[MAP/SEND]").event, MirrorEvent::SyncStarted);
        assert_eq!(mirror.phase(), MirrorPhase::Syncing);
        for chunk in chunks(&source) {
            let outcome = mirror.receive(&chunk.to_wire());
            assert!(matches!(outcome.event, MirrorEvent::ChunkApplied { .. }));
            assert!(outcome.request.is_none());
        }
        let outcome = mirror.receive("[MAP/END]");
        assert_eq!(
            outcome.event,
            MirrorEvent::FrameReady { bytes_received: 100, complete: true }
        );
        assert_eq!(mirror.phase(), MirrorPhase::Ready);
        assert_eq!(mirror.snapshot(), source);
        assert!(!mirror.is_collecting());
        assert_eq!(mirror.frames_completed(), 1);
    }

    #[test]
    fn test_skipped_chunk_requests_one_resend() {
        let all = chunks(&source());
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");

        let outcomes: Vec<Outcome> = [0usize, 2, 3]
            .iter()
            .map(|&i| mirror.receive(&all[i].to_wire()))
            .collect();

        assert_eq!(requests(&outcomes), vec![ClientMessage::Resend { sequence_id: 1 }]);
        assert_eq!(mirror.bytes_received(), all[0].payload.len());
        assert_eq!(mirror.expected_sequence_id(), 1);
        assert_eq!(
            outcomes[1].event,
            MirrorEvent::GapDetected { expected: 1, received: 2 }
        );

        // End marker while incomplete does not ask for 1 again
        let end = mirror.receive("[MAP/END]");
        assert_eq!(
            end.event,
            MirrorEvent::FrameReady { bytes_received: all[0].payload.len(), complete: false }
        );
        assert!(end.request.is_none());
    }

    #[test]
    fn test_late_chunk_recovers_frame() {
        let source = source();
        let all = chunks(&source);
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");
        for (i, chunk) in all.iter().enumerate() {
            if i != 1 {
                mirror.receive(&chunk.to_wire());
            }
        }
        mirror.receive("[MAP/END]");
        assert!(mirror.is_collecting());

        // Resent chunk 1 lands after the end marker; 2 is then asked for once
        let outcome = mirror.receive(&all[1].to_wire());
        assert_eq!(outcome.request, Some(ClientMessage::Resend { sequence_id: 2 }));

        let mut last = outcome;
        for chunk in &all[2..] {
            last = mirror.receive(&chunk.to_wire());
        }
        assert_eq!(
            last.event,
            MirrorEvent::FrameReady { bytes_received: 100, complete: true }
        );
        assert_eq!(mirror.snapshot(), source);
        assert!(!mirror.is_collecting());
    }

    #[test]
    fn test_end_with_missing_tail_requests_it() {
        let all = chunks(&source());
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");
        mirror.receive(&all[0].to_wire());

        let end = mirror.receive("[MAP/END]");
        assert_eq!(end.request, Some(ClientMessage::Resend { sequence_id: 1 }));
    }

    #[test]
    fn test_pixels_during_sync_survive_stale_chunks() {
        let all = chunks(&BitCanvas::new(W, H));
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");

        // Cell 150 lives in byte 18, inside chunk 1
        let outcome = mirror.receive("[PIXEL]x:30,y:3,c:1");
        assert_eq!(
            outcome.event,
            MirrorEvent::PixelChanged { x: 30, y: 3, painted: true }
        );
        for chunk in &all {
            mirror.receive(&chunk.to_wire());
        }
        mirror.receive("[MAP/END]");
        assert_eq!(mirror.pixel(30, 3), Some(true));
        assert_eq!(mirror.canvas().painted_count(), 1);
    }

    #[test]
    fn test_pixel_applies_in_any_phase() {
        let mut mirror = MirrorReconciler::new(4, 4);
        mirror.receive("[PIXEL]x:1,y:0,c:1");
        assert_eq!(mirror.canvas().raw_bytes(), &[0x02, 0x00]);
        assert_eq!(mirror.phase(), MirrorPhase::Idle);
        assert!(!mirror.is_collecting());
    }

    #[test]
    fn test_invalid_pixels_ignored() {
        let mut mirror = MirrorReconciler::new(4, 4);
        assert_eq!(mirror.receive("[PIXEL]x:4,y:0,c:1").event, MirrorEvent::Ignored);
        assert_eq!(mirror.receive("[PIXEL]x:0,y:0,c:3").event, MirrorEvent::Ignored);
        assert_eq!(mirror.receive("[MAP/CHUNK:0:0]0").event, MirrorEvent::Ignored);
        assert_eq!(mirror.receive("hello").event, MirrorEvent::Ignored);
        assert_eq!(mirror.canvas().painted_count(), 0);
    }

    #[test]
    fn test_repeated_message_collapsed() {
        let mut mirror = MirrorReconciler::new(4, 4);
        assert!(matches!(
            mirror.receive("[PIXEL]x:1,y:1,c:1").event,
            MirrorEvent::PixelChanged { .. }
        ));
        assert_eq!(mirror.receive("[PIXEL]x:1,y:1,c:1").event, MirrorEvent::Duplicate);
        assert!(matches!(
            mirror.receive("[PIXEL]x:1,y:1,c:0").event,
            MirrorEvent::PixelChanged { .. }
        ));
    }

    #[test]
    fn test_chunk_outside_session_ignored() {
        let mut mirror = MirrorReconciler::new(4, 4);
        assert_eq!(mirror.receive("[MAP/CHUNK:0:0]FFFF").event, MirrorEvent::Ignored);
        assert_eq!(mirror.receive("[MAP/END]").event, MirrorEvent::Ignored);
        assert_eq!(mirror.canvas().painted_count(), 0);
    }

    #[test]
    fn test_restart_resets_progress() {
        let all = chunks(&source());
        let mut mirror = MirrorReconciler::new(W, H);
        mirror.receive("[MAP/SEND]");
        mirror.receive(&all[0].to_wire());
        mirror.receive(&all[2].to_wire());

        mirror.receive("[MAP/END]");
        assert_eq!(mirror.receive("[MAP/SEND]").event, MirrorEvent::SyncStarted);
        assert_eq!(mirror.bytes_received(), 0);
        assert_eq!(mirror.expected_sequence_id(), 0);
        assert_eq!(mirror.canvas().painted_count(), 0);

        // A fresh session may request id 1 again
        mirror.receive(&all[0].to_wire());
        let outcome = mirror.receive(&all[2].to_wire());
        assert_eq!(outcome.request, Some(ClientMessage::Resend { sequence_id: 1 }));
    }

    #[test]
    fn test_legacy_header_and_clamped_write() {
        let mut mirror = MirrorReconciler::new(4, 4);
        mirror.receive("[MAP/SEND]");
        // Three bytes for a two-byte canvas: the excess is dropped
        let outcome = mirror.receive("[MAP/CHUNK:0]FF01AA");
        assert_eq!(
            outcome.event,
            MirrorEvent::ChunkApplied { sequence_id: 0, bytes_received: 2 }
        );
        assert_eq!(mirror.canvas().raw_bytes(), &[0xFF, 0x01]);
    }

    #[test]
    fn test_canvas_announcement() {
        let mut mirror = MirrorReconciler::new(200, 200);
        assert_eq!(
            mirror.receive("[CANVAS]w:200,h:200").event,
            MirrorEvent::CanvasAnnounced {
                server: CanvasInfo { width: 200, height: 200 },
                matches: true
            }
        );
        assert_eq!(
            mirror.receive("[CANVAS]w:100,h:50").event,
            MirrorEvent::CanvasAnnounced {
                server: CanvasInfo { width: 100, height: 50 },
                matches: false
            }
        );
    }

    #[test]
    fn test_local_edits() {
        let mut mirror = MirrorReconciler::new(4, 4);
        assert_eq!(mirror.toggle_local(2, 2), Some(PixelUpdate::new(2, 2, true)));
        assert_eq!(mirror.toggle_local(2, 2), Some(PixelUpdate::new(2, 2, false)));
        assert_eq!(mirror.set_local(0, 3, true), Some(PixelUpdate::new(0, 3, true)));
        assert_eq!(mirror.pixel(0, 3), Some(true));
        assert_eq!(mirror.toggle_local(4, 0), None);
        assert_eq!(mirror.set_local(0, 4, true), None);
    }
}
