//! Timestamp alignment of per-topic frames into frame groups.

use crate::decoder::Frame;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Frames from several topics that share a base timestamp.
///
/// A topic is absent when it had no message inside the tolerance window and
/// present with `None` when its message failed to decode.
#[derive(Debug, Clone)]
pub struct FrameGroup {
    pub frame_index: u64,
    pub base_timestamp_ns: u64,
    pub frames: BTreeMap<String, Option<Arc<Frame>>>,
}

impl FrameGroup {
    pub fn frame(&self, topic: &str) -> Option<&Arc<Frame>> {
        self.frames.get(topic).and_then(|f| f.as_ref())
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }
}

/// Groups time-ordered messages into [`FrameGroup`]s.
///
/// The window is anchored at the first message of a group and never slides,
/// so a slow drift across topics cannot chain groups together.
#[derive(Debug)]
pub struct FrameSynchronizer {
    tolerance_ns: u64,
    next_index: u64,
    current_base_time: Option<u64>,
    current_group: BTreeMap<String, Option<Arc<Frame>>>,
}

impl FrameSynchronizer {
    pub fn new(tolerance_ns: u64, start_index: u64) -> Self {
        Self {
            tolerance_ns,
            next_index: start_index,
            current_base_time: None,
            current_group: BTreeMap::new(),
        }
    }

    /// Index the next sealed group will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Add a message; returns the previous group when this message opens a new one.
    pub fn push(
        &mut self,
        topic: &str,
        timestamp_ns: u64,
        frame: Option<Arc<Frame>>,
    ) -> Option<FrameGroup> {
        let opens_group = match self.current_base_time {
            None => true,
            Some(base) => timestamp_ns.abs_diff(base) > self.tolerance_ns,
        };

        if !opens_group {
            self.current_group.insert(topic.to_string(), frame);
            return None;
        }

        let sealed = self.seal();
        self.current_base_time = Some(timestamp_ns);
        self.current_group.insert(topic.to_string(), frame);
        sealed
    }

    /// Seal the open group at end of stream.
    pub fn flush(&mut self) -> Option<FrameGroup> {
        let sealed = self.seal();
        self.current_base_time = None;
        sealed
    }

    fn seal(&mut self) -> Option<FrameGroup> {
        if self.current_group.is_empty() {
            return None;
        }
        let base_timestamp_ns = self.current_base_time?;
        let group = FrameGroup {
            frame_index: self.next_index,
            base_timestamp_ns,
            frames: std::mem::take(&mut self.current_group),
        };
        self.next_index += 1;
        Some(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PixelFormat;
    use bytes::Bytes;

    const MS: u64 = 1_000_000;

    fn frame(value: u8) -> Option<Arc<Frame>> {
        Some(Arc::new(Frame {
            width: 1,
            height: 1,
            format: PixelFormat::Mono8,
            data: Bytes::from(vec![value]),
        }))
    }

    fn run(sync: &mut FrameSynchronizer, messages: &[(&str, u64)]) -> Vec<FrameGroup> {
        let mut groups: Vec<FrameGroup> = messages
            .iter()
            .filter_map(|(topic, ts)| sync.push(topic, *ts, frame(0)))
            .collect();
        groups.extend(sync.flush());
        groups
    }

    #[test]
    fn test_single_topic_thirty_fps() {
        let mut sync = FrameSynchronizer::new(3 * MS, 0);
        let messages: Vec<(&str, u64)> = (0..100).map(|i| ("/cam", i * 33 * MS)).collect();
        let groups = run(&mut sync, &messages);

        assert_eq!(groups.len(), 100);
        for (i, group) in groups.iter().enumerate() {
            assert_eq!(group.frame_index, i as u64);
            assert_eq!(group.frames.len(), 1);
            assert_eq!(group.base_timestamp_ns, i as u64 * 33 * MS);
        }
    }

    #[test]
    fn test_matched_pairs_share_groups() {
        let mut sync = FrameSynchronizer::new(3 * MS, 0);
        let mut messages = Vec::new();
        for i in 0..50u64 {
            messages.push(("/cam/left", i * 33 * MS));
            messages.push(("/cam/right", i * 33 * MS + MS));
        }
        let groups = run(&mut sync, &messages);

        assert_eq!(groups.len(), 50);
        for group in &groups {
            let topics: Vec<&str> = group.topics().collect();
            assert_eq!(topics, vec!["/cam/left", "/cam/right"]);
        }
    }

    #[test]
    fn test_window_is_anchored_not_rolling() {
        let mut sync = FrameSynchronizer::new(3 * MS, 0);
        // each step is inside the tolerance of the previous message, but the
        // third is 4 ms from the base
        let groups = run(&mut sync, &[("/a", 0), ("/b", 2 * MS), ("/c", 4 * MS)]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].frames.len(), 2);
        assert_eq!(groups[1].base_timestamp_ns, 4 * MS);
        assert!(groups[1].frames.contains_key("/c"));
    }

    #[test]
    fn test_no_merge_beyond_tolerance() {
        let tolerance = 3 * MS;
        let mut sync = FrameSynchronizer::new(tolerance, 0);
        let timestamps = [0, MS, 3 * MS, 4 * MS, 6 * MS, 7 * MS, 20 * MS, 23 * MS, 24 * MS];
        let topics: Vec<String> = (0..timestamps.len()).map(|i| format!("/m{}", i)).collect();

        let mut groups = Vec::new();
        for (topic, ts) in topics.iter().zip(timestamps) {
            groups.extend(sync.push(topic, ts, frame(0)));
        }
        groups.extend(sync.flush());

        let mut seen = 0;
        for group in &groups {
            for topic in group.topics() {
                let i: usize = topic[2..].parse().unwrap();
                assert!(timestamps[i].abs_diff(group.base_timestamp_ns) <= tolerance);
                seen += 1;
            }
        }
        assert_eq!(seen, timestamps.len());
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn test_partial_group_and_last_write_wins() {
        let mut sync = FrameSynchronizer::new(3 * MS, 10);
        sync.push("/a", 0, frame(1));
        sync.push("/a", MS, frame(2));
        let group = sync.push("/a", 40 * MS, None).unwrap();

        assert_eq!(group.frame_index, 10);
        assert_eq!(group.frames.len(), 1);
        assert_eq!(group.frame("/a").unwrap().data.as_ref(), &[2]);

        // failed decode keeps the slot
        let tail = sync.flush().unwrap();
        assert_eq!(tail.frame_index, 11);
        assert!(tail.frames.contains_key("/a"));
        assert!(tail.frame("/a").is_none());
        assert_eq!(sync.next_index(), 12);
    }

    #[test]
    fn test_flush_on_empty_is_none() {
        let mut sync = FrameSynchronizer::new(3 * MS, 0);
        assert!(sync.flush().is_none());
    }
}
