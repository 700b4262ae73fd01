//! Episode bookkeeping for rollout collection
//!
//! Tracks completed-episode lengths for the adaptive horizon along with a
//! handful of counters reported by the environments.

use std::collections::VecDeque;

use crate::env::StepInfo;

/// Most recent episode lengths kept for the horizon estimate
pub const EPISODE_HISTORY: usize = 1000;

/// Length the history is seeded with on reset, so the horizon estimate
/// starts long rather than at zero
pub const INITIAL_EPISODE_LENGTH: usize = 1000;

/// Environment event counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutCounters {
    /// Rewards clipped by the environment
    pub reward_clips: usize,

    /// Environments that froze and were restarted
    pub game_crashes: usize,

    /// Steps where the environment repeated the previous action
    pub action_repeats: usize,

    /// `action_repeats` within the current rollout
    pub batch_action_repeats: usize,
}

/// An episode that ended during collection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletedEpisode {
    /// Raw score
    pub score: f32,
    /// Number of steps
    pub length: usize,
}

/// Episode statistics accumulated across rollouts
#[derive(Debug, Clone)]
pub struct EpisodeStats {
    episode_lengths: VecDeque<usize>,
    counters: RolloutCounters,
    ep_count: usize,
}

impl EpisodeStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self {
            episode_lengths: VecDeque::with_capacity(EPISODE_HISTORY),
            counters: RolloutCounters::default(),
            ep_count: 0,
        }
    }

    /// Clear everything and seed the length history
    pub fn reset(&mut self) {
        self.episode_lengths.clear();
        self.episode_lengths.push_back(INITIAL_EPISODE_LENGTH);
        self.counters = RolloutCounters::default();
        self.ep_count = 0;
    }

    /// Start a new rollout
    pub fn begin_rollout(&mut self) {
        self.counters.batch_action_repeats = 0;
    }

    /// Account for one agent's step
    ///
    /// Returns the finished episode when `done` ends a real episode. Fake
    /// terminals contribute their length to the history but don't count as
    /// episodes.
    pub fn record(&mut self, info: &StepInfo, done: bool) -> Option<CompletedEpisode> {
        self.counters.reward_clips += info.reward_clips;
        if info.game_freeze {
            self.counters.game_crashes += 1;
        }
        if info.repeated_action {
            self.counters.action_repeats += 1;
            self.counters.batch_action_repeats += 1;
        }

        if !done {
            return None;
        }
        if let Some(length) = info.ep_length {
            if self.episode_lengths.len() == EPISODE_HISTORY {
                self.episode_lengths.pop_front();
            }
            self.episode_lengths.push_back(length);
        }
        if info.fake_done {
            return None;
        }

        self.ep_count += 1;
        Some(CompletedEpisode {
            score: info.ep_score.unwrap_or(0.0),
            length: info.ep_length.unwrap_or(0),
        })
    }

    /// Completed (real) episodes since reset
    pub fn ep_count(&self) -> usize {
        self.ep_count
    }

    /// Event counters
    pub fn counters(&self) -> &RolloutCounters {
        &self.counters
    }

    /// Recent episode lengths, oldest first
    pub fn episode_lengths(&self) -> &VecDeque<usize> {
        &self.episode_lengths
    }

    /// Mean of the length history, 0 when empty
    pub fn episode_length_mean(&self) -> f32 {
        if self.episode_lengths.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.episode_lengths.iter().map(|&l| l as f64).sum();
        (sum / self.episode_lengths.len() as f64) as f32
    }

    /// Population standard deviation of the length history, 0 when empty
    pub fn episode_length_std(&self) -> f32 {
        if self.episode_lengths.is_empty() {
            return 0.0;
        }
        let mean = self.episode_length_mean() as f64;
        let sq: f64 = self.episode_lengths.iter().map(|&l| (l as f64 - mean).powi(2)).sum();
        (sq / self.episode_lengths.len() as f64).sqrt() as f32
    }

    /// Mean plus two standard deviations of the length history
    pub fn length_horizon(&self) -> f32 {
        if self.episode_lengths.is_empty() {
            0.0
        } else {
            self.episode_length_mean() + 2.0 * self.episode_length_std()
        }
    }
}

impl Default for EpisodeStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(length: usize, score: f32, fake: bool) -> StepInfo {
        StepInfo {
            ep_length: Some(length),
            ep_score: Some(score),
            fake_done: fake,
            ..Default::default()
        }
    }

    #[test]
    fn test_reset_seeds_history() {
        let mut stats = EpisodeStats::new();
        assert_eq!(stats.length_horizon(), 0.0);

        stats.reset();
        assert_eq!(stats.episode_lengths().len(), 1);
        assert_eq!(stats.episode_length_mean(), 1000.0);
        assert_eq!(stats.length_horizon(), 1000.0);
    }

    #[test]
    fn test_record_episodes() {
        let mut stats = EpisodeStats::new();
        stats.reset();

        assert_eq!(stats.record(&StepInfo::default(), false), None);
        let episode = stats.record(&finished(200, 3.0, false), true);
        assert_eq!(episode, Some(CompletedEpisode { score: 3.0, length: 200 }));
        assert_eq!(stats.ep_count(), 1);

        // history is now [1000, 200]: mean 600, std 400
        assert!((stats.episode_length_mean() - 600.0).abs() < 1e-3);
        assert!((stats.episode_length_std() - 400.0).abs() < 1e-3);
        assert!((stats.length_horizon() - 1400.0).abs() < 1e-2);
    }

    #[test]
    fn test_fake_done_records_length_only() {
        let mut stats = EpisodeStats::new();
        stats.reset();

        assert_eq!(stats.record(&finished(50, 1.0, true), true), None);
        assert_eq!(stats.ep_count(), 0);
        assert_eq!(stats.episode_lengths().len(), 2);
    }

    #[test]
    fn test_history_is_capped() {
        let mut stats = EpisodeStats::new();
        stats.reset();
        for _ in 0..EPISODE_HISTORY {
            stats.record(&finished(10, 0.0, false), true);
        }
        assert_eq!(stats.episode_lengths().len(), EPISODE_HISTORY);
        // the seeded entry has been pushed out
        assert_eq!(stats.episode_length_mean(), 10.0);
        assert_eq!(stats.episode_length_std(), 0.0);
    }

    #[test]
    fn test_counters() {
        let mut stats = EpisodeStats::new();
        stats.reset();
        let info = StepInfo {
            reward_clips: 2,
            game_freeze: true,
            repeated_action: true,
            ..Default::default()
        };
        stats.record(&info, false);
        stats.record(&info, false);
        assert_eq!(stats.counters().reward_clips, 4);
        assert_eq!(stats.counters().game_crashes, 2);
        assert_eq!(stats.counters().action_repeats, 2);
        assert_eq!(stats.counters().batch_action_repeats, 2);

        stats.begin_rollout();
        assert_eq!(stats.counters().batch_action_repeats, 0);
        assert_eq!(stats.counters().action_repeats, 2);
    }
}
