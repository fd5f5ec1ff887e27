//! Config pool: shared global config lifetime across in-flight frames
//!
//! Multiple frames may be decoding concurrently while all sharing one
//! unmodified global config. The pool owns the "latest" config and hands
//! each inserted frame a shared reference to it; a frame whose payload
//! changes the global config causes a fresh snapshot to be published as the
//! new latest, while earlier frames keep their reference to the superseded
//! one until released.
//!
//! `frame_insert` must be called in non-decreasing timestamp order; the
//! pool checks this defensively. The pool performs no internal locking:
//! callers that insert and release from multiple threads must serialize
//! those calls with the same external synchronization that orders the
//! timestamps (decode itself is freely concurrent per tile).

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::config::parser::configs_parse;
use crate::config::{BitstreamVersion, FrameConfig, GlobalConfig, NalType, QuantMatrix};
use crate::error::{Error, Result};

/// Pool of reference-counted global config snapshots plus the frame-to-frame
/// stateful parameters.
pub struct ConfigPool {
    /// Every snapshot handed out that may still be alive.
    configs: Vec<Weak<GlobalConfig>>,
    /// The most recent global config; new frames reference this.
    latest: Arc<GlobalConfig>,
    /// Stateful between frames: the last signalled quant matrix.
    quant_matrix: QuantMatrix,
    /// Stateful between frames: the last signalled dither flag.
    dither_enabled: bool,
    /// Timestamp of the most recently inserted frame.
    last_timestamp: Option<u64>,
}

impl ConfigPool {
    /// Create a pool whose initial latest config carries defaults.
    ///
    /// Passing a `bitstream_version` pins parsing to that standard
    /// revision; with `None` the version is picked up from the stream.
    pub fn new(bitstream_version: Option<BitstreamVersion>) -> Self {
        let latest = Arc::new(GlobalConfig::new(bitstream_version));
        ConfigPool {
            configs: vec![Arc::downgrade(&latest)],
            latest,
            quant_matrix: QuantMatrix::default(),
            dither_enabled: false,
            last_timestamp: None,
        }
    }

    /// Number of global config snapshots still referenced by the pool or by
    /// outstanding frames.
    pub fn live_config_count(&mut self) -> usize {
        self.configs.retain(|weak| weak.strong_count() > 0);
        self.configs.len()
    }

    /// Parse one frame's payload and return its configs.
    ///
    /// Seeds the stateful frame parameters from pool state, parses, and
    /// publishes a new latest global config snapshot when the payload
    /// changed it. Failure leaves the pool state untouched.
    ///
    /// Timestamps must be non-decreasing across calls.
    pub fn frame_insert(
        &mut self,
        timestamp: u64,
        nal_type: NalType,
        payload: &[u8],
    ) -> Result<(Arc<GlobalConfig>, FrameConfig)> {
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                return Err(Error::invalid_state(format!(
                    "Frame timestamps must be non-decreasing: {} after {}",
                    timestamp, last
                )));
            }
        }

        let mut frame = FrameConfig::default();

        // Seed the stateful parameters into the next frame config.
        if self.quant_matrix.set {
            frame.quant_matrix = self.quant_matrix;
        }
        frame.dither_enabled = self.dither_enabled;

        // Parse into a scratch copy of the current latest; on failure the
        // copy is dropped and nothing is published.
        let mut next = (*self.latest).clone();
        let global_config_written = configs_parse(payload, nal_type, &mut next, &mut frame)?;

        // Save the stateful parameters back to the pool.
        self.quant_matrix = frame.quant_matrix;
        self.dither_enabled = frame.dither_enabled;
        self.last_timestamp = Some(timestamp);

        if global_config_written && next != *self.latest {
            debug!(timestamp, "Publishing new global config");
            let new_latest = Arc::new(next);
            self.configs.push(Arc::downgrade(&new_latest));
            // Dropping the pool's reference to the superseded latest before
            // installing the new one: frames still holding it keep it alive.
            self.latest = new_latest;
            self.configs.retain(|weak| weak.strong_count() > 0);
        }

        Ok((Arc::clone(&self.latest), frame))
    }

    /// Release a frame's configs. The global config is freed once the last
    /// frame referencing it is released and it is no longer the latest.
    pub fn frame_release(&mut self, frame: FrameConfig, global: Arc<GlobalConfig>) {
        drop(frame);
        drop(global);
        self.configs.retain(|weak| weak.strong_count() > 0);
    }

    /// Hand out the current latest config without parsing, for frames whose
    /// enhancement is intentionally bypassed.
    pub fn frame_passthrough(&mut self) -> (Arc<GlobalConfig>, FrameConfig) {
        (Arc::clone(&self.latest), FrameConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransformType, LOQ_ENHANCED_COUNT};

    /// Minimal payload: a global config block for a 1920x1080 DDS stream.
    fn global_payload(temporal: bool) -> Vec<u8> {
        let mut block = Vec::new();
        block.push((7 << 5) | 1); // custom size, global config
        block.push(4);
        block.push(26 << 1 | 0x01);
        block.push(0b01_00_00_0_0);
        block.push(if temporal { 0b1_1_001_0_00 } else { 0b0_0_001_0_00 });
        block.push(0b10_00_00_0_0);
        block
    }

    /// Picture-config-only payload (relies on an already published global).
    fn picture_payload() -> Vec<u8> {
        let mut block = Vec::new();
        block.push((7 << 5) | 2); // custom size, picture config
        block.push(3);
        block.push(0);
        block.extend_from_slice(&(800u16 << 1).to_be_bytes());
        block
    }

    #[test]
    fn test_insert_parses_and_publishes() {
        let mut pool = ConfigPool::new(None);
        assert_eq!(pool.live_config_count(), 1);

        let (global, frame) = pool
            .frame_insert(0, NalType::Idr, &global_payload(true))
            .unwrap();
        assert!(global.initialized);
        assert_eq!(global.transform, TransformType::Dds);
        assert!(frame.global_config_set);

        // The default config was superseded unreferenced, leaving only the
        // newly published one.
        assert_eq!(pool.live_config_count(), 1);

        pool.frame_release(frame, global);
        assert_eq!(pool.live_config_count(), 1);
    }

    #[test]
    fn test_unmodified_config_is_shared() {
        let mut pool = ConfigPool::new(None);
        let (global_a, frame_a) = pool
            .frame_insert(0, NalType::Idr, &global_payload(true))
            .unwrap();

        let (global_b, frame_b) = pool.frame_insert(1, NalType::NonIdr, &picture_payload()).unwrap();
        // The second frame shares the first frame's snapshot.
        assert!(Arc::ptr_eq(&global_a, &global_b));
        assert_eq!(pool.live_config_count(), 1);

        pool.frame_release(frame_a, global_a);
        pool.frame_release(frame_b, global_b);
        assert_eq!(pool.live_config_count(), 1);
    }

    #[test]
    fn test_changed_config_publishes_new_snapshot() {
        let mut pool = ConfigPool::new(None);
        let (global_a, frame_a) = pool
            .frame_insert(0, NalType::Idr, &global_payload(true))
            .unwrap();

        // A different global config (temporal off) supersedes the latest,
        // but the in-flight frame keeps its snapshot alive.
        let (global_b, frame_b) = pool
            .frame_insert(1, NalType::Idr, &global_payload(false))
            .unwrap();
        assert!(!Arc::ptr_eq(&global_a, &global_b));
        assert!(global_a.temporal_enabled);
        assert!(!global_b.temporal_enabled);
        assert_eq!(pool.live_config_count(), 2);

        // Releasing the old frame frees the superseded snapshot.
        pool.frame_release(frame_a, global_a);
        assert_eq!(pool.live_config_count(), 1);
        pool.frame_release(frame_b, global_b);
        assert_eq!(pool.live_config_count(), 1);
    }

    #[test]
    fn test_insert_release_bound() {
        // N inserts each followed by a release never hold more than the
        // latest plus one superseded config; afterwards exactly the latest
        // survives.
        let mut pool = ConfigPool::new(None);
        for i in 0..8u64 {
            let temporal = i % 2 == 0;
            let (global, frame) = pool
                .frame_insert(i, NalType::Idr, &global_payload(temporal))
                .unwrap();
            assert!(pool.live_config_count() <= 2);
            pool.frame_release(frame, global);
        }
        assert_eq!(pool.live_config_count(), 1);
    }

    #[test]
    fn test_timestamps_must_not_go_backwards() {
        let mut pool = ConfigPool::new(None);
        pool.frame_insert(10, NalType::Idr, &global_payload(true))
            .unwrap();
        // Equal timestamps are accepted.
        pool.frame_insert(10, NalType::NonIdr, &picture_payload())
            .unwrap();
        assert!(pool
            .frame_insert(9, NalType::NonIdr, &picture_payload())
            .is_err());
    }

    #[test]
    fn test_failed_parse_leaves_pool_unchanged() {
        let mut pool = ConfigPool::new(None);
        pool.frame_insert(0, NalType::Idr, &global_payload(true))
            .unwrap();
        let count = pool.live_config_count();

        let mut bad = global_payload(true);
        bad.truncate(bad.len() - 1);
        assert!(pool.frame_insert(1, NalType::Idr, &bad).is_err());
        assert_eq!(pool.live_config_count(), count);
        // A failed insert does not advance the timestamp either.
        pool.frame_insert(0, NalType::NonIdr, &picture_payload())
            .unwrap();
    }

    #[test]
    fn test_stateful_quant_matrix_carries_between_frames() {
        let mut pool = ConfigPool::new(None);
        let mut payload = global_payload(false);

        // Picture config with a custom quant matrix (mode 5).
        let mut picture = Vec::new();
        picture.push((7 << 5) | 2);
        picture.push(35);
        picture.push(0b0_101_0_0_0_0);
        picture.extend_from_slice(&(800u16 << 1).to_be_bytes());
        picture.extend_from_slice(&[9u8; 16]);
        picture.extend_from_slice(&[7u8; 16]);
        payload.extend_from_slice(&picture);

        let (_global, frame) = pool.frame_insert(0, NalType::Idr, &payload).unwrap();
        assert_eq!(frame.quant_matrix.values[0], [9; 16]);

        // Next frame signals "use previous": the pool-seeded matrix holds.
        let (_global, frame) = pool
            .frame_insert(1, NalType::NonIdr, &picture_payload())
            .unwrap();
        assert_eq!(frame.quant_matrix.values[0], [9; 16]);
        assert_eq!(frame.quant_matrix.values[1], [7; 16]);
    }

    #[test]
    fn test_passthrough_shares_latest_without_parsing() {
        let mut pool = ConfigPool::new(None);
        let (global_a, _frame) = pool
            .frame_insert(0, NalType::Idr, &global_payload(true))
            .unwrap();

        let (global_b, frame_b) = pool.frame_passthrough();
        assert!(Arc::ptr_eq(&global_a, &global_b));
        assert!(!frame_b.frame_config_set);
        assert_eq!(frame_b.loq_enabled, [false; LOQ_ENHANCED_COUNT]);
    }
}
