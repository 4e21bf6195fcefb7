//! The allocation tax: how much tracing a mutator does in return for an allocation, and the
//! tuning that keeps the tax just high enough for tracing to finish before the heap fills up.

use super::mode::ExecutionMode;
use crate::global_state::CollectorState;
use crate::util::math::{interpolate_in_range, scale, weighted_average};
use crate::util::options::Options;
use atomic::Atomic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// Calibration points at concurrent levels 1, 8 and 10.
const MAX_ALLOC_TO_TRACE_RATE: (f32, f32, f32) = (4.0, 2.0, 1.8);
const MIN_ALLOC_TO_TRACE_RATE: (f32, f32, f32) = (1.0, 2.0, 2.0);
const INITIAL_CARD_CLEANING_FACTOR: (f32, f32, f32) = (0.5, 0.05, 0.05);
const MAX_CARD_CLEANING_FACTOR: (f32, f32, f32) = (0.8, 0.2, 0.2);
const CARD_CLEANING_THRESHOLD_FACTOR: (f32, f32, f32) = (4.0, 3.0, 1.5);

const LAST_FREE_SIZE_NEEDS_INITIALIZING: usize = usize::MAX;

fn calibrated(points: (f32, f32, f32), level: usize) -> f32 {
    interpolate_in_range(points.0, points.1, points.2, level)
}

/// Samples taken by periodical tuning.
#[derive(Default)]
struct TuningSamples {
    last_total_traced: usize,
    last_helper_traced: usize,
    /// Bytes traced per byte allocated over the last interval.
    last_average_rate: f32,
    max_average_rate: f32,
}

pub(crate) struct AllocationTax {
    /// Bytes of init work per byte allocated while initializing.
    alloc_to_init_rate: usize,
    /// The configured tracing rate.
    normal_trace_rate: f32,
    alloc_to_trace_rate: Atomic<f32>,
    /// Multiplied by the trace rate to get the highest rate a mutator is charged.
    max_factor: f32,
    /// Multiplied by the trace rate to get the lowest rate a mutator is charged.
    min_factor: f32,
    /// Bytes per allocated byte that helper threads have been tracing recently.
    alloc_to_helper_trace_rate: Atomic<f32>,
    card_cleaning_threshold_factor: f32,
    max_card_cleaning_factor: f32,
    card_cleaning_factor: Atomic<f32>,
    /// Fraction of the collectible heap that survives a cycle.
    live_factor: Atomic<f32>,
    /// Fraction of live bytes that are traced, i.e. contain references.
    non_leaf_factor: Atomic<f32>,
    bytes_to_trace: AtomicUsize,
    bytes_to_clean: AtomicUsize,
    /// Free memory reserved above the point where tracing would have to finish.
    kickoff_buffer: AtomicUsize,
    /// Free memory at the last periodical tuning sample.
    last_free_size: AtomicUsize,
    /// Bytes allocated between periodical tuning samples. Also the helper tracing budget.
    tuning_update_interval: AtomicUsize,
    samples: Mutex<TuningSamples>,

    over_tracing_boost_factor: f32,
    kickoff_threshold_boost: f32,
    concurrent_slack: usize,
    min_trace_size: usize,
    max_trace_size: usize,
    tuning_heap_size_factor: f32,
    live_part_history_weight: f32,
    non_leaf_history_weight: f32,
    helper_history_weight: f32,
    card_cleaning_history_weight: f32,
}

impl AllocationTax {
    pub fn new(options: &Options) -> Self {
        let level = options.concurrent_level;
        Self {
            alloc_to_init_rate: level * options.init_boost_factor,
            normal_trace_rate: level as f32,
            alloc_to_trace_rate: Atomic::new(level as f32),
            max_factor: calibrated(MAX_ALLOC_TO_TRACE_RATE, level),
            min_factor: 1.0 / calibrated(MIN_ALLOC_TO_TRACE_RATE, level),
            alloc_to_helper_trace_rate: Atomic::new(0.0),
            card_cleaning_threshold_factor: calibrated(CARD_CLEANING_THRESHOLD_FACTOR, level),
            max_card_cleaning_factor: calibrated(MAX_CARD_CLEANING_FACTOR, level),
            card_cleaning_factor: Atomic::new(calibrated(INITIAL_CARD_CLEANING_FACTOR, level)),
            live_factor: Atomic::new(options.initial_live_part_factor),
            non_leaf_factor: Atomic::new(options.initial_non_leaf_factor),
            bytes_to_trace: AtomicUsize::new(0),
            bytes_to_clean: AtomicUsize::new(0),
            kickoff_buffer: AtomicUsize::new(0),
            last_free_size: AtomicUsize::new(LAST_FREE_SIZE_NEEDS_INITIALIZING),
            tuning_update_interval: AtomicUsize::new(options.min_trace_size),
            samples: Mutex::new(TuningSamples::default()),
            over_tracing_boost_factor: options.over_tracing_boost_factor,
            kickoff_threshold_boost: options.kickoff_threshold_boost,
            concurrent_slack: options.concurrent_slack,
            min_trace_size: options.min_trace_size,
            max_trace_size: options.max_trace_size,
            tuning_heap_size_factor: options.tuning_heap_size_factor,
            live_part_history_weight: options.live_part_history_weight,
            non_leaf_history_weight: options.non_leaf_history_weight,
            helper_history_weight: options.helper_history_weight,
            card_cleaning_history_weight: options.card_cleaning_history_weight,
        }
    }

    pub fn alloc_to_trace_rate(&self) -> f32 {
        self.alloc_to_trace_rate.load(Ordering::SeqCst)
    }

    pub fn max_trace_rate(&self) -> f32 {
        self.alloc_to_trace_rate() * self.max_factor
    }

    pub fn min_trace_rate(&self) -> f32 {
        self.alloc_to_trace_rate() * self.min_factor
    }

    pub fn helper_trace_rate(&self) -> f32 {
        self.alloc_to_helper_trace_rate.load(Ordering::SeqCst)
    }

    pub fn kickoff_buffer(&self) -> usize {
        self.kickoff_buffer.load(Ordering::SeqCst)
    }

    pub fn tuning_update_interval(&self) -> usize {
        self.tuning_update_interval.load(Ordering::SeqCst)
    }

    pub fn live_factor(&self) -> f32 {
        self.live_factor.load(Ordering::SeqCst)
    }

    pub fn non_leaf_factor(&self) -> f32 {
        self.non_leaf_factor.load(Ordering::SeqCst)
    }

    pub fn card_cleaning_factor(&self) -> f32 {
        self.card_cleaning_factor.load(Ordering::SeqCst)
    }

    /// Bytes of mark-bit initialization owed for an allocation of `tax_size` bytes.
    pub fn init_size_for(&self, tax_size: usize) -> usize {
        tax_size.saturating_mul(self.alloc_to_init_rate)
    }

    /// Bytes of tracing owed for an allocation of `tax_size` bytes, given the taxable free
    /// memory. The result never exceeds `tax_size` times the maximum trace rate, nor the
    /// configured per-allocation maximum.
    pub fn trace_size_for(
        &self,
        tax_size: usize,
        remaining_free: usize,
        state: &CollectorState,
        forced_kickoff: bool,
    ) -> usize {
        let remaining = remaining_free.saturating_sub(self.kickoff_buffer());
        let done = state.concurrent_work_done();
        let target = state.trace_size_target();
        let configured = self.alloc_to_trace_rate();
        let max_rate = configured * self.max_factor;

        let size = if remaining > 0 && done < target {
            let mut rate = (target - done) as f32 / remaining as f32;
            if rate > configured {
                rate += (rate - configured) * self.over_tracing_boost_factor;
                rate = rate.min(max_rate);
            } else {
                rate = rate.max(configured * self.min_factor);
            }
            if forced_kickoff {
                rate = rate.max(self.normal_trace_rate).min(max_rate);
            }
            let helper_rate = self.helper_trace_rate();
            if rate > helper_rate {
                scale(tax_size, rate - helper_rate)
            } else {
                0
            }
        } else {
            // We are behind. Trace as fast as we are allowed to.
            scale(tax_size, max_rate)
        };
        size.min(self.max_trace_size)
    }

    /// Has enough memory been allocated since the last sample to tune again?
    pub fn periodical_tuning_needed(&self, free_size: usize) -> bool {
        let last = self.last_free_size.load(Ordering::SeqCst);
        last == LAST_FREE_SIZE_NEEDS_INITIALIZING
            || (last > free_size && last - free_size > self.tuning_update_interval())
    }

    /// Sample the tracing done by mutators and helpers since the last sample and update the
    /// helper rate that is credited to mutators.
    pub fn periodical_tuning(&self, free_size: usize, state: &CollectorState, helpers_started: bool) {
        let mut samples = self.samples.lock().unwrap();
        let last = self.last_free_size.load(Ordering::SeqCst);

        if last == LAST_FREE_SIZE_NEEDS_INITIALIZING {
            self.last_free_size.store(free_size, Ordering::SeqCst);
            let interval = scale(free_size, self.tuning_heap_size_factor)
                .clamp(self.min_trace_size, self.max_trace_size);
            self.tuning_update_interval.store(interval, Ordering::SeqCst);
            trace!("Periodical tuning started at {} free, interval {}", free_size, interval);
            return;
        }

        // Another thread may have sampled while we waited for the lock.
        if last <= free_size || last - free_size < self.tuning_update_interval() {
            return;
        }

        let used = (last - free_size) as f32;
        let mut total_traced = state.trace_size_count.load(Ordering::SeqCst)
            + state.card_clean_count.load(Ordering::SeqCst);
        if helpers_started {
            let helper_traced = state.helper_trace_size_count.load(Ordering::SeqCst)
                + state.helper_card_clean_count.load(Ordering::SeqCst);
            let recent = helper_traced.saturating_sub(samples.last_helper_traced) as f32 / used;
            let rate = weighted_average(self.helper_trace_rate(), recent, self.helper_history_weight);
            self.alloc_to_helper_trace_rate.store(rate, Ordering::SeqCst);
            samples.last_helper_traced = helper_traced;
            total_traced += helper_traced;
        }

        samples.last_average_rate = total_traced.saturating_sub(samples.last_total_traced) as f32 / used;
        samples.max_average_rate = samples.max_average_rate.max(samples.last_average_rate);
        samples.last_total_traced = total_traced;
        self.last_free_size.store(free_size, Ordering::SeqCst);
        trace!(
            "Periodical tuning at {} free: average rate {:.2}, helper rate {:.2}",
            free_size,
            samples.last_average_rate,
            self.helper_trace_rate()
        );
    }

    fn reset_periodical_tuning(&self) {
        let mut samples = self.samples.lock().unwrap();
        *samples = TuningSamples::default();
        self.last_free_size
            .store(LAST_FREE_SIZE_NEEDS_INITIALIZING, Ordering::SeqCst);
        self.alloc_to_helper_trace_rate.store(0.0, Ordering::SeqCst);
    }

    fn estimate_from_heap(&self, heap_size: usize) -> (usize, usize) {
        let live = self.live_factor() * self.non_leaf_factor();
        let trace = scale(heap_size, live);
        (trace, scale(trace, self.card_cleaning_factor()))
    }

    /// Derive the work expected of the next cycle and the thresholds that start it. Resets the
    /// per-cycle counters of `state`, so call this after `update_tuning_statistics`.
    ///
    /// The estimate is taken from the heap size the first time, after a resize (`retune`), or
    /// when the last cycle did not get far enough to measure anything. Otherwise it is taken
    /// from what the last cycle actually traced. An explicit collection keeps the previous
    /// estimate.
    pub fn tune_to_heap(
        &self,
        heap_size: usize,
        init_work: usize,
        state: &CollectorState,
        retune: bool,
        explicit: bool,
    ) {
        if heap_size == 0 {
            return;
        }

        let (trace, clean) = if state.kickoff_threshold() == 0 || retune {
            self.estimate_from_heap(heap_size)
        } else if explicit {
            (
                self.bytes_to_trace.load(Ordering::SeqCst),
                self.bytes_to_clean.load(Ordering::SeqCst),
            )
        } else {
            let stats = state.snapshot();
            match state.mode_at_gc() {
                mode if mode >= ExecutionMode::Exhausted => {
                    let traced = stats.trace_size_count + stats.helper_trace_size_count;
                    let cleaned = stats.card_clean_count + stats.helper_card_clean_count;
                    (
                        weighted_average(
                            self.bytes_to_trace.load(Ordering::SeqCst) as f32,
                            traced as f32,
                            self.live_part_history_weight,
                        ) as usize,
                        weighted_average(
                            self.bytes_to_clean.load(Ordering::SeqCst) as f32,
                            cleaned as f32,
                            self.card_cleaning_history_weight,
                        ) as usize,
                    )
                }
                ExecutionMode::CleanTrace => (
                    stats.trace_size_count
                        + stats.helper_trace_size_count
                        + stats.completed_tracing_count
                        + stats.final_trace_count,
                    stats.card_clean_count
                        + stats.helper_card_clean_count
                        + state.final_card_clean_count.load(Ordering::SeqCst),
                ),
                _ => self.estimate_from_heap(heap_size),
            }
        };

        self.bytes_to_trace.store(trace, Ordering::SeqCst);
        self.bytes_to_clean.store(clean, Ordering::SeqCst);
        self.alloc_to_trace_rate
            .store(self.normal_trace_rate, Ordering::SeqCst);

        let target = trace + clean;
        state.trace_size_target.store(target, Ordering::SeqCst);

        let kickoff = init_work / self.alloc_to_init_rate + (target as f32 / self.normal_trace_rate) as usize;
        let card_cleaning = (kickoff as f32 / self.card_cleaning_threshold_factor) as usize;
        let boost = scale(kickoff, self.kickoff_threshold_boost).saturating_sub(kickoff);
        let kickoff_plus_buffer = kickoff + boost + self.concurrent_slack;
        let card_cleaning_plus_buffer = if kickoff > 0 {
            card_cleaning + boost + scale(self.concurrent_slack, card_cleaning as f32 / kickoff as f32)
        } else {
            card_cleaning + boost
        };

        state
            .kickoff_threshold
            .store(kickoff_plus_buffer, Ordering::SeqCst);
        state
            .card_cleaning_threshold
            .store(card_cleaning_plus_buffer, Ordering::SeqCst);
        self.kickoff_buffer
            .store(kickoff_plus_buffer - kickoff, Ordering::SeqCst);

        debug!(
            "Tuned to heap of {} bytes: trace {} clean {} kickoff {} card cleaning {} buffer {}",
            heap_size,
            trace,
            clean,
            kickoff_plus_buffer,
            card_cleaning_plus_buffer,
            kickoff_plus_buffer - kickoff
        );

        state.reset();
        self.reset_periodical_tuning();
    }

    /// Re-derive the trace target after the heap changed size during a cycle.
    pub fn adjust_trace_target(&self, heap_size: usize, state: &CollectorState) {
        let (trace, clean) = self.estimate_from_heap(heap_size);
        state.trace_size_target.store(trace + clean, Ordering::SeqCst);
        debug!("Adjusted trace target to {} for a heap of {} bytes", trace + clean, heap_size);
    }

    /// Learn from a cycle that reached tracing. `live_bytes` is the size of the objects found
    /// live in the `heap_size` bytes of collectible heap.
    pub fn update_tuning_statistics(&self, heap_size: usize, live_bytes: usize, state: &CollectorState) {
        let mode = state.mode_at_gc();
        if mode < ExecutionMode::TraceOnly || heap_size == 0 {
            return;
        }
        let stats = state.snapshot();

        let live_part = (live_bytes as f32 / heap_size as f32).min(1.0);
        self.live_factor.store(
            weighted_average(self.live_factor(), live_part, self.live_part_history_weight),
            Ordering::SeqCst,
        );

        let mut traced = stats.trace_size_count + stats.helper_trace_size_count;
        if mode < ExecutionMode::Exhausted {
            traced += stats.final_trace_count;
        }
        if live_bytes > 0 {
            let non_leaf_part = (traced as f32 / live_bytes as f32).min(1.0);
            self.non_leaf_factor.store(
                weighted_average(self.non_leaf_factor(), non_leaf_part, self.non_leaf_history_weight),
                Ordering::SeqCst,
            );
        }

        let card_cleaning = match mode {
            ExecutionMode::TraceOnly => Some(self.max_card_cleaning_factor),
            ExecutionMode::Exhausted | ExecutionMode::FinalCollection => {
                let cleaned = stats.card_clean_count + stats.helper_card_clean_count;
                Some(if traced > 0 {
                    (cleaned as f32 / traced as f32).min(self.max_card_cleaning_factor)
                } else {
                    self.max_card_cleaning_factor
                })
            }
            _ => None,
        };
        if let Some(new_factor) = card_cleaning {
            self.card_cleaning_factor.store(
                weighted_average(
                    self.card_cleaning_factor(),
                    new_factor,
                    self.card_cleaning_history_weight,
                ),
                Ordering::SeqCst,
            );
        }

        debug!(
            "Tuning statistics after {}: live {:.3} non-leaf {:.3} card cleaning {:.3}",
            mode,
            self.live_factor(),
            self.non_leaf_factor(),
            self.card_cleaning_factor()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const MB: usize = 1 << 20;

    fn tax() -> AllocationTax {
        AllocationTax::new(&Options::default())
    }

    fn state_with_target(target: usize) -> CollectorState {
        let state = CollectorState::new();
        state.trace_size_target.store(target, Ordering::SeqCst);
        state
    }

    #[test]
    fn rates_at_default_level() {
        let tax = tax();
        assert_eq!(tax.alloc_to_trace_rate(), 8.0);
        assert_eq!(tax.max_trace_rate(), 16.0);
        assert_eq!(tax.min_trace_rate(), 4.0);
        assert_eq!(tax.init_size_for(100), 6400);
    }

    #[test]
    fn tax_is_bounded() {
        let tax = tax();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10_000 {
            let state = state_with_target(rng.random_range(0..100 * MB));
            state
                .trace_size_count
                .store(rng.random_range(0..100 * MB), Ordering::SeqCst);
            let size = rng.random_range(1..64 * 1024);
            let free = rng.random_range(0..200 * MB);
            let forced = rng.random_bool(0.5);
            let traced = tax.trace_size_for(size, free, &state, forced);
            assert!(
                traced as f64 <= size as f64 * tax.max_trace_rate() as f64,
                "{} > {} * {}",
                traced,
                size,
                tax.max_trace_rate()
            );
        }
    }

    #[test]
    fn no_free_memory_charges_max_rate() {
        let tax = tax();
        let state = state_with_target(10 * MB);
        assert_eq!(tax.trace_size_for(1000, 0, &state, false), 16_000);
    }

    #[test]
    fn target_reached_charges_max_rate() {
        let tax = tax();
        let state = state_with_target(MB);
        state.trace_size_count.store(MB, Ordering::SeqCst);
        assert_eq!(tax.trace_size_for(1000, 10 * MB, &state, false), 16_000);
    }

    #[test]
    fn on_schedule_charges_at_least_min_rate() {
        let tax = tax();
        // One byte of work per byte of free memory is below the min rate of 4.
        let state = state_with_target(MB);
        assert_eq!(tax.trace_size_for(1000, MB, &state, false), 4000);
        // A forced kickoff charges at least the configured rate.
        assert_eq!(tax.trace_size_for(1000, MB, &state, true), 8000);
    }

    #[test]
    fn behind_schedule_boosts_the_rate() {
        let tax = tax();
        // 10 bytes of work per byte of free memory: 10 + (10 - 8) * 2 = 14.
        let state = state_with_target(10 * MB);
        assert_eq!(tax.trace_size_for(1000, MB, &state, false), 14_000);
        // 12 bytes per byte: 12 + 4 * 2 = 20, capped at 16.
        let state = state_with_target(12 * MB);
        assert_eq!(tax.trace_size_for(1000, MB, &state, false), 16_000);
    }

    #[test]
    fn helper_rate_is_credited() {
        let tax = tax();
        tax.alloc_to_helper_trace_rate.store(3.0, Ordering::SeqCst);
        let state = state_with_target(MB);
        assert_eq!(tax.trace_size_for(1000, MB, &state, false), 1000);
        tax.alloc_to_helper_trace_rate.store(5.0, Ordering::SeqCst);
        assert_eq!(tax.trace_size_for(1000, MB, &state, false), 0);
    }

    #[test]
    fn tax_is_capped_per_allocation() {
        let mut options = Options::default();
        options.max_trace_size = 5000;
        let tax = AllocationTax::new(&options);
        let state = state_with_target(MB);
        assert_eq!(tax.trace_size_for(1000, 0, &state, false), 5000);
    }

    #[test]
    fn first_tuning_estimates_from_heap() {
        let tax = tax();
        let state = CollectorState::new();
        tax.tune_to_heap(100 * MB, 0, &state, false, false);

        let trace = scale(100 * MB, 0.7 * 0.4);
        let clean = scale(trace, 0.05);
        assert_eq!(state.trace_size_target(), trace + clean);
        let kickoff = ((trace + clean) as f32 / 8.0) as usize;
        let buffer = scale(kickoff, 1.10) - kickoff;
        assert_eq!(state.kickoff_threshold(), kickoff + buffer);
        assert_eq!(tax.kickoff_buffer(), buffer);
        let card_cleaning = (kickoff as f32 / 3.0) as usize;
        assert_eq!(state.card_cleaning_threshold(), card_cleaning + buffer);
    }

    #[test]
    fn init_work_raises_the_kickoff_threshold() {
        let tax = tax();
        let without = CollectorState::new();
        tax.tune_to_heap(100 * MB, 0, &without, false, false);
        let with = CollectorState::new();
        tax.tune_to_heap(100 * MB, 64 * MB, &with, false, false);
        assert!(with.kickoff_threshold() > without.kickoff_threshold());
    }

    #[test]
    fn tuning_resets_counters_and_zero_heap_is_ignored() {
        let tax = tax();
        let state = CollectorState::new();
        state.trace_size_count.store(123, Ordering::SeqCst);
        tax.tune_to_heap(0, 0, &state, false, false);
        assert_eq!(state.kickoff_threshold(), 0);
        assert_eq!(state.concurrent_work_done(), 123);
        tax.tune_to_heap(MB, 0, &state, false, false);
        assert_eq!(state.concurrent_work_done(), 0);
    }

    #[test]
    fn exhausted_cycle_averages_traced_bytes() {
        let tax = tax();
        let state = CollectorState::new();
        tax.tune_to_heap(100 * MB, 0, &state, false, false);
        let before = tax.bytes_to_trace.load(Ordering::SeqCst);

        state.trace_size_count.store(10 * MB, Ordering::SeqCst);
        state.set_mode_at_gc(ExecutionMode::Exhausted);
        tax.tune_to_heap(100 * MB, 0, &state, false, false);
        let expected = weighted_average(before as f32, (10 * MB) as f32, 0.8) as usize;
        assert_eq!(tax.bytes_to_trace.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn periodical_tuning_samples_helper_rate() {
        let tax = tax();
        let state = CollectorState::new();
        assert!(tax.periodical_tuning_needed(100 * MB));
        tax.periodical_tuning(100 * MB, &state, true);
        assert_eq!(tax.tuning_update_interval(), 5 * MB);
        assert!(!tax.periodical_tuning_needed(100 * MB - MB));

        state.helper_trace_size_count.store(60 * MB, Ordering::SeqCst);
        let free = 100 * MB - 6 * MB;
        assert!(tax.periodical_tuning_needed(free));
        tax.periodical_tuning(free, &state, true);
        // 60 MB traced over 6 MB allocated, weighted 40% against an initial 0.
        assert!((tax.helper_trace_rate() - 4.0).abs() < 1e-3);
        assert!(!tax.periodical_tuning_needed(free));
    }

    #[test]
    fn statistics_follow_the_last_cycle() {
        let tax = tax();
        let state = CollectorState::new();
        state.set_mode_at_gc(ExecutionMode::TraceOnly);
        tax.update_tuning_statistics(100 * MB, 50 * MB, &state);
        assert!((tax.live_factor() - weighted_average(0.7, 0.5, 0.8)).abs() < 1e-6);
        // Card cleaning never ran: move towards the maximum.
        assert!((tax.card_cleaning_factor() - weighted_average(0.05, 0.2, 0.7)).abs() < 1e-6);

        // A cycle aborted before tracing teaches nothing.
        let tax = AllocationTax::new(&Options::default());
        state.set_mode_at_gc(ExecutionMode::InitRunning);
        tax.update_tuning_statistics(100 * MB, 50 * MB, &state);
        assert_eq!(tax.live_factor(), 0.7);
    }
}
