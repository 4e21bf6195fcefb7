//! Policy knobs of the concurrent mark and sweep schedulers.
//!
//! Every option can be set through an environment variable with the `GENCON_` prefix, e.g.
//! `GENCON_CONCURRENT_LEVEL=4`, or programmatically with [`Options::set_from_str`] before the
//! collector is created.

use std::default::Default;

/// The default rate (bytes traced per byte allocated) of a concurrent cycle.
pub const DEFAULT_CONCURRENT_LEVEL: usize = 8;
/// The default size of a sweep chunk.
pub const DEFAULT_SWEEP_CHUNK_SIZE: usize = 256 * 1024;
/// Free runs smaller than this are left as dark matter instead of becoming free entries.
pub const DEFAULT_MIN_FREE_ENTRY_SIZE: usize = 512;

fn always_valid<T>(_: &T) -> bool {
    true
}

fn is_fraction(v: &f32) -> bool {
    (0.0..=1.0).contains(v)
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake case name. Returns false and keeps the old value if
            /// the value cannot be parsed or is rejected by the validator.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with GENCON_ and match any option (such as GENCON_CONCURRENT_LEVEL),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "GENCON_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Bytes a mutator traces per byte it allocates during a normal concurrent cycle. Also selects the
    // calibration point for the min/max rate and card-cleaning factors.
    concurrent_level:             usize [|v: &usize| (1..=10).contains(v)] = DEFAULT_CONCURRENT_LEVEL,
    // Multiplier applied to the concurrent level while mark bits are being initialized.
    init_boost_factor:            usize [|v: &usize| *v > 0] = 8,
    // Extra tracing rate applied for every unit the required rate is above the configured one.
    over_tracing_boost_factor:    f32   [|v: &f32| *v >= 0.0] = 2.0,
    // Multiplier applied to the kickoff and card-cleaning thresholds.
    kickoff_threshold_boost:      f32   [|v: &f32| *v >= 1.0] = 1.10,
    // Bytes of additional headroom added to the kickoff threshold.
    concurrent_slack:             usize [always_valid] = 0,
    // Lower bound of the periodical tuning interval, in bytes.
    min_trace_size:               usize [|v: &usize| *v > 0] = 1000,
    // Upper bound of the tax a single allocation pays, and of the tuning interval.
    max_trace_size:               usize [|v: &usize| *v > 0] = 0x2000_0000,
    // Fraction of free memory allocated between periodical tuning samples.
    tuning_heap_size_factor:      f32   [is_fraction] = 0.05,
    // Bytes of mark bits initialized per claimed init chunk.
    init_chunk_size:              usize [|v: &usize| *v > 0] = 8 * 1024,
    // Initial guess of the live fraction of the collectible heap.
    initial_live_part_factor:     f32   [is_fraction] = 0.7,
    live_part_history_weight:     f32   [is_fraction] = 0.8,
    // Initial guess of the fraction of live bytes that contain references.
    initial_non_leaf_factor:      f32   [is_fraction] = 0.4,
    non_leaf_history_weight:      f32   [is_fraction] = 0.8,
    helper_history_weight:        f32   [is_fraction] = 0.6,
    card_cleaning_history_weight: f32   [is_fraction] = 0.7,
    // Number of background helper threads. 0 means mutators do all the tracing.
    concurrent_helper_threads:    usize [always_valid] = 1,
    // Capacity of the shared work-packet stack, in references.
    work_packet_capacity:         usize [|v: &usize| *v > 0] = 64 * 1024,
    // References a tracer keeps locally before spilling half of them to the shared stack.
    local_buffer_size:            usize [|v: &usize| *v > 0] = 512,
    // Number of unproductive spins after which an idle helper parks.
    helper_spin_limit:            usize [|v: &usize| *v > 0] = 16,
    // Size of a sweep chunk. Must be a power of two.
    sweep_chunk_size:             usize [|v: &usize| v.is_power_of_two() && *v >= 1024] = DEFAULT_SWEEP_CHUNK_SIZE,
    // Number of threads used to finish a sweep while the world is stopped.
    sweep_threads:                usize [|v: &usize| *v > 0] = num_cpus::get(),
    min_free_entry_size:          usize [|v: &usize| *v > 0] = DEFAULT_MIN_FREE_ENTRY_SIZE,
    // Free ratio assumed for unconnected memory before any sweep has completed.
    previous_free_ratio_initial:  f32   [is_fraction] = 0.3,
    free_history_weight_startup:  f32   [is_fraction] = 0.5,
    free_history_weight_running:  f32   [is_fraction] = 0.8,
    // Number of sweeps that use the startup history weight.
    startup_sweep_count:          usize [always_valid] = 5,
    // Should the sweep run concurrently after a collection? If false, it completes before the mutators resume.
    concurrent_sweep:             bool  [always_valid] = true,
    // Should concurrent cycles start at all? If false, every collection is a full stop-the-world mark.
    concurrent_kickoff_enabled:   bool  [always_valid] = true,
}

impl Options {
    /// Set an option by its camel case name, e.g. `concurrentLevel`.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }
}
