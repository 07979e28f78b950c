use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{MagmalinkError, MagmalinkResult};
use crate::model::track::Track;

pub const DEFAULT_MAX_PREVIOUS_TRACKS: usize = 20;

/// Ordered track container for one player. `current` is the track being
/// played now and never occupies a queue slot; `previous` is a bounded
/// history ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub current: Option<Track>,
    tracks: VecDeque<Track>,
    previous: VecDeque<Track>,
    #[serde(default = "default_max_previous")]
    max_previous: usize,
}

fn default_max_previous() -> usize {
    DEFAULT_MAX_PREVIOUS_TRACKS
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PREVIOUS_TRACKS)
    }
}

impl Queue {
    pub fn new(max_previous: usize) -> Self {
        Self {
            current: None,
            tracks: VecDeque::new(),
            previous: VecDeque::new(),
            max_previous,
        }
    }

    /// Upcoming tracks in play order.
    pub fn tracks(&self) -> &VecDeque<Track> {
        &self.tracks
    }

    /// Played history, oldest first.
    pub fn previous(&self) -> &VecDeque<Track> {
        &self.previous
    }

    pub fn size(&self) -> usize {
        self.tracks.len()
    }

    /// Upcoming plus the current track.
    pub fn total_size(&self) -> usize {
        self.tracks.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Summed duration of the current track and everything upcoming, in
    /// milliseconds.
    pub fn duration(&self) -> u64 {
        self.current
            .iter()
            .chain(self.tracks.iter())
            .map(|t| t.duration.unwrap_or(0))
            .sum()
    }

    /// Adds one track. When nothing is playing the track becomes `current`
    /// without occupying a queue slot; the return value reports that
    /// promotion.
    pub fn add(&mut self, track: Track) -> bool {
        if self.current.is_none() {
            self.current = Some(track);
            true
        } else {
            self.tracks.push_back(track);
            false
        }
    }

    /// Adds several tracks, optionally at an offset into the upcoming
    /// sequence. The first track still promotes to `current` when nothing is
    /// playing.
    pub fn add_many(&mut self, tracks: Vec<Track>, offset: Option<usize>) {
        let mut tracks = tracks.into_iter();

        if self.current.is_none() {
            match tracks.next() {
                Some(first) => self.current = Some(first),
                None => return,
            }
        }

        match offset {
            Some(offset) => {
                let at = offset.min(self.tracks.len());
                for (i, track) in tracks.enumerate() {
                    self.tracks.insert(at + i, track);
                }
            }
            None => self.tracks.extend(tracks),
        }
    }

    pub fn remove(&mut self, position: usize) -> MagmalinkResult<Track> {
        self.tracks
            .remove(position)
            .ok_or(MagmalinkError::InvalidQueuePosition(position))
    }

    /// Removes `start..end` from the upcoming sequence and returns the
    /// removed tracks.
    pub fn remove_range(&mut self, start: usize, end: usize) -> MagmalinkResult<Vec<Track>> {
        if start >= end || start >= self.tracks.len() {
            return Err(MagmalinkError::InvalidQueueRange { start, end });
        }

        let end = end.min(self.tracks.len());
        Ok(self.tracks.drain(start..end).collect())
    }

    /// Clears the upcoming sequence; `current` and history are untouched.
    pub fn clear(&mut self) -> Vec<Track> {
        self.tracks.drain(..).collect()
    }

    /// Fisher-Yates over the upcoming sequence.
    pub fn shuffle(&mut self) {
        let mut tracks: Vec<Track> = self.tracks.drain(..).collect();
        tracks.shuffle(&mut rand::thread_rng());
        self.tracks = tracks.into();
    }

    /// Keeps each requester's consecutive runs intact and deals one full run
    /// per requester in round-robin order of first appearance.
    pub fn user_block_shuffle(&mut self) {
        let tracks: Vec<Track> = self.tracks.drain(..).collect();
        let mut order: Vec<String> = Vec::new();
        let mut runs: Vec<(String, VecDeque<Vec<Track>>)> = Vec::new();
        let mut prev_key: Option<String> = None;

        for track in tracks {
            let key = requester_key(&track);
            if !order.contains(&key) {
                order.push(key.clone());
                runs.push((key.clone(), VecDeque::new()));
            }

            let entry = runs
                .iter_mut()
                .find(|(k, _)| *k == key)
                .expect("run entry exists once the key is registered");

            if prev_key.as_deref() == Some(key.as_str()) {
                entry.1.back_mut().expect("a run was opened for this key").push(track);
            } else {
                entry.1.push_back(vec![track]);
            }
            prev_key = Some(key);
        }

        let mut out = VecDeque::new();
        let mut remaining = true;
        while remaining {
            remaining = false;
            for key in &order {
                if let Some((_, pending)) = runs.iter_mut().find(|(k, _)| k == key) {
                    if let Some(run) = pending.pop_front() {
                        out.extend(run);
                        remaining = remaining || !pending.is_empty();
                    }
                }
            }
        }

        self.tracks = out;
    }

    /// Groups by requester, shuffles inside each group, then deals one track
    /// per requester in round-robin order of first appearance.
    pub fn round_robin_shuffle(&mut self) {
        let tracks: Vec<Track> = self.tracks.drain(..).collect();
        let mut order: Vec<String> = Vec::new();
        let mut groups: Vec<(String, Vec<Track>)> = Vec::new();

        for track in tracks {
            let key = requester_key(&track);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(track),
                None => {
                    order.push(key.clone());
                    groups.push((key, vec![track]));
                }
            }
        }

        let mut rng = rand::thread_rng();
        for (_, group) in groups.iter_mut() {
            group.shuffle(&mut rng);
        }

        let mut queues: Vec<(String, VecDeque<Track>)> = groups
            .into_iter()
            .map(|(k, g)| (k, VecDeque::from(g)))
            .collect();

        let mut out = VecDeque::new();
        let mut remaining = true;
        while remaining {
            remaining = false;
            for key in &order {
                if let Some((_, group)) = queues.iter_mut().find(|(k, _)| k == key) {
                    if let Some(track) = group.pop_front() {
                        out.push_back(track);
                        remaining = remaining || !group.is_empty();
                    }
                }
            }
        }

        self.tracks = out;
    }

    /// Shifts the next upcoming track into `current` and returns a clone of
    /// it. `current` must be pushed to history by the caller first when that
    /// is wanted.
    pub fn advance(&mut self) -> Option<Track> {
        self.current = self.tracks.pop_front();
        self.current.clone()
    }

    /// Appends to the history ring, dropping the oldest entry past the cap.
    pub fn push_previous(&mut self, track: Track) {
        if self.max_previous == 0 {
            return;
        }

        if self.previous.len() >= self.max_previous {
            self.previous.pop_front();
        }
        self.previous.push_back(track);
    }

    /// Pops the most recent history entry.
    pub fn pop_previous(&mut self) -> Option<Track> {
        self.previous.pop_back()
    }

    pub fn push_front(&mut self, track: Track) {
        self.tracks.push_front(track);
    }

    pub fn push_back(&mut self, track: Track) {
        self.tracks.push_back(track);
    }

    /// Drops the first `n` upcoming tracks.
    pub fn drop_front(&mut self, n: usize) -> Vec<Track> {
        let n = n.min(self.tracks.len());
        self.tracks.drain(..n).collect()
    }
}

fn requester_key(track: &Track) -> String {
    track
        .requester
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn track(id: &str, requester: &str) -> Track {
        Track {
            track: id.to_string(),
            title: Some(id.to_string()),
            duration: Some(1_000),
            requester: Some(json!(requester)),
            ..Default::default()
        }
    }

    #[test]
    fn first_add_promotes_to_current() {
        let mut queue = Queue::default();

        assert!(queue.add(track("a", "u1")));
        assert_eq!(queue.current.as_ref().unwrap().track, "a");
        assert_eq!(queue.size(), 0);

        assert!(!queue.add(track("b", "u1")));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn add_many_with_offset_inserts_in_order() {
        let mut queue = Queue::default();
        queue.add(track("current", "u1"));
        queue.add_many(vec![track("a", "u1"), track("d", "u1")], None);
        queue.add_many(vec![track("b", "u1"), track("c", "u1")], Some(1));

        let order: Vec<_> = queue.tracks().iter().map(|t| t.track.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn remove_range_rejects_bad_bounds() {
        let mut queue = Queue::default();
        queue.add(track("current", "u1"));
        queue.add_many(vec![track("a", "u1"), track("b", "u1")], None);

        assert!(matches!(
            queue.remove_range(1, 1),
            Err(MagmalinkError::InvalidQueueRange { .. })
        ));
        assert!(matches!(
            queue.remove_range(5, 6),
            Err(MagmalinkError::InvalidQueueRange { .. })
        ));

        let removed = queue.remove_range(0, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn previous_ring_respects_cap() {
        let mut queue = Queue::new(2);

        queue.push_previous(track("a", "u1"));
        queue.push_previous(track("b", "u1"));
        queue.push_previous(track("c", "u1"));

        let ids: Vec<_> = queue.previous().iter().map(|t| t.track.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn shuffle_preserves_membership() {
        let mut queue = Queue::default();
        queue.add(track("current", "u1"));
        queue.add_many((0..32).map(|i| track(&format!("t{}", i), "u1")).collect(), None);

        queue.shuffle();

        assert_eq!(queue.size(), 32);
        let mut ids: Vec<_> = queue.tracks().iter().map(|t| t.track.clone()).collect();
        ids.sort();
        let mut expected: Vec<_> = (0..32).map(|i| format!("t{}", i)).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn user_block_shuffle_keeps_runs_together() {
        let mut queue = Queue::default();
        queue.add(track("current", "u1"));
        queue.add_many(
            vec![
                track("a1", "alice"),
                track("a2", "alice"),
                track("b1", "bob"),
                track("a3", "alice"),
            ],
            None,
        );

        queue.user_block_shuffle();

        let order: Vec<_> = queue.tracks().iter().map(|t| t.track.as_str()).collect();
        // Alice's first run stays intact, then bob's run, then alice's second.
        assert_eq!(order, vec!["a1", "a2", "b1", "a3"]);
    }

    #[test]
    fn round_robin_alternates_requesters() {
        let mut queue = Queue::default();
        queue.add(track("current", "u1"));
        queue.add_many(
            vec![
                track("a1", "alice"),
                track("a2", "alice"),
                track("b1", "bob"),
                track("b2", "bob"),
            ],
            None,
        );

        queue.round_robin_shuffle();

        let owners: Vec<_> = queue
            .tracks()
            .iter()
            .map(|t| t.requester.clone().unwrap())
            .collect();
        assert_eq!(owners, vec![json!("alice"), json!("bob"), json!("alice"), json!("bob")]);
    }

    #[test]
    fn duration_sums_current_and_upcoming() {
        let mut queue = Queue::default();
        queue.add(track("a", "u1"));
        queue.add(track("b", "u1"));

        assert_eq!(queue.duration(), 2_000);
        assert_eq!(queue.total_size(), 2);
    }

    #[test]
    fn advance_shifts_upcoming_into_current() {
        let mut queue = Queue::default();
        queue.add(track("a", "u1"));
        queue.add(track("b", "u1"));

        let next = queue.advance().unwrap();
        assert_eq!(next.track, "b");
        assert!(queue.is_empty());

        assert!(queue.advance().is_none());
        assert!(queue.current.is_none());
    }
}
