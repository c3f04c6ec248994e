// ========================================================================================
//                     The update orchestrator: one EM step, two phases
// ========================================================================================
//
// Phase 1 folds every block's flows into the per-node accumulator; phase 2 rewrites
// the parameters against it. Both phases split the schedule into the same work
// units, and phase 2 is only entered after the parallel iterator of phase 1 has
// joined, so the update never observes a partially aggregated node.

use crate::accumulator::FlowAccumulator;
use crate::kernel::{self, BlendConstants, SharedParams};
use crate::types::CompiledSchedule;
use rayon::prelude::*;
use std::time::Instant;
use thiserror::Error;

/// The hyperparameters of one EM step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmStep {
    /// Blend weight of the re-estimate; 1.0 replaces the parameters outright.
    pub step_size: f32,
    /// Dirichlet smoothing strength added to numerator and denominator.
    pub pseudocount: f32,
}

impl Default for EmStep {
    fn default() -> Self {
        Self {
            step_size: 1.0,
            pseudocount: 0.0,
        }
    }
}

impl EmStep {
    pub fn validate(&self) -> Result<(), UpdateError> {
        if !(0.0..=1.0).contains(&self.step_size) {
            return Err(UpdateError::StepSizeOutOfRange(self.step_size));
        }
        if !(self.pseudocount.is_finite() && self.pseudocount >= 0.0) {
            return Err(UpdateError::InvalidPseudocount(self.pseudocount));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    #[error("Step size must lie in [0, 1], but was {0}.")]
    StepSizeOutOfRange(f32),
    #[error("Pseudocount must be finite and non-negative, but was {0}.")]
    InvalidPseudocount(f32),
    #[error("The schedule addresses {expected} {which} entries, but only {found} were supplied.")]
    ArrayTooShort {
        which: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("The {which} table has {found} entries, but the schedule has {expected} nodes.")]
    NodeTableMismatch {
        which: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Runs one EM step in place, using the child counts derived at compile time.
///
/// `cum_flows` may carry an accumulator from an earlier call; it is zeroed here
/// and left holding this step's per-node flow totals. Without one, a temporary
/// accumulator is allocated for the call.
pub fn update(
    params: &mut [f32],
    param_flows: &[f32],
    schedule: &CompiledSchedule,
    step: EmStep,
    cum_flows: Option<&mut FlowAccumulator>,
) -> Result<(), UpdateError> {
    update_with_child_counts(
        params,
        param_flows,
        schedule,
        schedule.node_child_counts(),
        step,
        cum_flows,
    )
}

/// Runs one EM step in place with an explicit per-node child-count table, as
/// supplied by the node-graph layer.
pub fn update_with_child_counts(
    params: &mut [f32],
    param_flows: &[f32],
    schedule: &CompiledSchedule,
    nchs: &[f32],
    step: EmStep,
    cum_flows: Option<&mut FlowAccumulator>,
) -> Result<(), UpdateError> {
    // --- Entry Point Validation ---
    step.validate()?;
    check_length("parameter", schedule.param_extent(), params.len())?;
    check_length("parameter-flow", schedule.flow_extent(), param_flows.len())?;
    let tot_num_nodes = schedule.tot_num_nodes();
    if nchs.len() != tot_num_nodes {
        return Err(UpdateError::NodeTableMismatch {
            which: "child-count",
            expected: tot_num_nodes,
            found: nchs.len(),
        });
    }

    let mut owned;
    let cum_flows = match cum_flows {
        Some(acc) => {
            if acc.len() != tot_num_nodes {
                return Err(UpdateError::NodeTableMismatch {
                    which: "accumulator",
                    expected: tot_num_nodes,
                    found: acc.len(),
                });
            }
            acc.reset();
            acc
        }
        None => {
            owned = FlowAccumulator::new(tot_num_nodes);
            &mut owned
        }
    };

    let start_time = Instant::now();
    let blocks_per_unit = schedule.blocks_per_unit();
    log::trace!(
        "EM step over {} blocks in {} units of {} (step size {}, pseudocount {})",
        schedule.num_blocks(),
        schedule.num_units(),
        blocks_per_unit,
        step.step_size,
        step.pseudocount
    );

    // --- Phase 1: aggregate flows per node ---
    let acc: &FlowAccumulator = cum_flows;
    schedule
        .blocks()
        .par_chunks(blocks_per_unit)
        .for_each(|unit| kernel::aggregate_unit(unit, param_flows, acc));

    // --- Phase 2: re-estimate and blend ---
    // A zero step keeps every parameter bit for bit, whatever the re-estimate is.
    if step.step_size == 0.0 {
        log::debug!(
            "EM step with step size 0 aggregated {} blocks in {:.2?}; parameters kept",
            schedule.num_blocks(),
            start_time.elapsed()
        );
        return Ok(());
    }
    let constants = BlendConstants {
        step_size: step.step_size,
        pseudocount: step.pseudocount,
    };
    let shared = SharedParams::new(params);
    schedule
        .blocks()
        .par_chunks(blocks_per_unit)
        .for_each(|unit| {
            // SAFETY: the schedule's extent was checked against `params.len()` above,
            // and a compiled schedule never addresses one parameter from two blocks.
            unsafe { kernel::update_unit(unit, &shared, param_flows, acc, nchs, constants) }
        });

    log::debug!(
        "EM step over {} blocks finished in {:.2?}",
        schedule.num_blocks(),
        start_time.elapsed()
    );
    Ok(())
}

fn check_length(which: &'static str, expected: usize, found: usize) -> Result<(), UpdateError> {
    if found < expected {
        return Err(UpdateError::ArrayTooShort {
            which,
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_with_defaults;
    use crate::types::{GroupKind, NodeGroupLayout};
    use approx::assert_abs_diff_eq;

    fn two_child_node() -> CompiledSchedule {
        let groups = [NodeGroupLayout {
            kind: GroupKind::Sum,
            tied: false,
            num_node_groups: 1,
            group_size: 1,
            ch_group_size: 1,
            edge_parents: vec![0, 0],
            param_range: 0..2,
            param_flow_range: 0..2,
        }];
        compile_with_defaults(&groups).unwrap()
    }

    #[test]
    fn full_step_without_prior_normalizes_the_flows() {
        let schedule = two_child_node();
        let mut params = vec![0.5, 0.5];
        let mut acc = FlowAccumulator::new(1);
        update(&mut params, &[3.0, 7.0], &schedule, EmStep::default(), Some(&mut acc)).unwrap();

        assert_abs_diff_eq!(acc.get(0), 10.0);
        assert_abs_diff_eq!(params[0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(params[1], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn pseudocount_smooths_towards_uniform() {
        let schedule = two_child_node();
        let mut params = vec![0.5, 0.5];
        let step = EmStep {
            step_size: 1.0,
            pseudocount: 2.0,
        };
        update(&mut params, &[3.0, 7.0], &schedule, step, None).unwrap();

        assert_abs_diff_eq!(params[0], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(params[1], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn reused_accumulator_is_zeroed_between_calls() {
        let schedule = two_child_node();
        let mut params = vec![0.5, 0.5];
        let mut acc = schedule.new_accumulator();
        for _ in 0..3 {
            update(&mut params, &[1.0, 1.0], &schedule, EmStep::default(), Some(&mut acc)).unwrap();
        }
        assert_eq!(acc.get(0), 2.0);
    }

    #[test]
    fn zero_step_keeps_parameter_bits_and_still_aggregates() {
        let schedule = two_child_node();
        let mut params: Vec<f32> = vec![-0.0, 0.5];
        let before: Vec<u32> = params.iter().map(|p| p.to_bits()).collect();
        let mut acc = schedule.new_accumulator();
        let step = EmStep {
            step_size: 0.0,
            pseudocount: 1.0,
        };
        update(&mut params, &[f32::INFINITY, 7.0], &schedule, step, Some(&mut acc)).unwrap();

        let after: Vec<u32> = params.iter().map(|p| p.to_bits()).collect();
        assert_eq!(after, before);
        assert_eq!(acc.get(0), f32::INFINITY);
    }

    #[test]
    fn rejects_invalid_steps() {
        let schedule = two_child_node();
        let mut params = vec![0.5, 0.5];
        let flows = [1.0, 1.0];
        for (step, expected) in [
            (
                EmStep { step_size: 1.5, pseudocount: 0.0 },
                UpdateError::StepSizeOutOfRange(1.5),
            ),
            (
                EmStep { step_size: -0.1, pseudocount: 0.0 },
                UpdateError::StepSizeOutOfRange(-0.1),
            ),
            (
                EmStep { step_size: 0.5, pseudocount: -1.0 },
                UpdateError::InvalidPseudocount(-1.0),
            ),
        ] {
            assert_eq!(update(&mut params, &flows, &schedule, step, None).unwrap_err(), expected);
        }
        assert!(matches!(
            update(&mut params, &flows, &schedule, EmStep { step_size: f32::NAN, pseudocount: 0.0 }, None),
            Err(UpdateError::StepSizeOutOfRange(_))
        ));
        assert_eq!(params, vec![0.5, 0.5]);
    }

    #[test]
    fn rejects_arrays_shorter_than_the_schedule() {
        let schedule = two_child_node();
        let mut short = vec![0.5];
        assert_eq!(
            update(&mut short, &[1.0, 1.0], &schedule, EmStep::default(), None).unwrap_err(),
            UpdateError::ArrayTooShort {
                which: "parameter",
                expected: 2,
                found: 1,
            }
        );

        let mut params = vec![0.5, 0.5];
        assert_eq!(
            update(&mut params, &[1.0], &schedule, EmStep::default(), None).unwrap_err(),
            UpdateError::ArrayTooShort {
                which: "parameter-flow",
                expected: 2,
                found: 1,
            }
        );

        let mut wrong = FlowAccumulator::new(4);
        assert_eq!(
            update(&mut params, &[1.0, 1.0], &schedule, EmStep::default(), Some(&mut wrong)).unwrap_err(),
            UpdateError::NodeTableMismatch {
                which: "accumulator",
                expected: 1,
                found: 4,
            }
        );

        assert_eq!(
            update_with_child_counts(
                &mut params,
                &[1.0, 1.0],
                &schedule,
                &[2.0, 2.0],
                EmStep::default(),
                None
            )
            .unwrap_err(),
            UpdateError::NodeTableMismatch {
                which: "child-count",
                expected: 1,
                found: 2,
            }
        );
        assert_eq!(params, vec![0.5, 0.5]);
    }

    #[test]
    fn explicit_child_counts_drive_the_prior() {
        let schedule = two_child_node();
        let mut params = vec![0.5, 0.5];
        let step = EmStep {
            step_size: 1.0,
            pseudocount: 2.0,
        };
        // Pretending the node had four children halves the per-entry prior.
        update_with_child_counts(&mut params, &[3.0, 7.0], &schedule, &[4.0], step, None).unwrap();
        assert_abs_diff_eq!(params[0], 3.5 / 12.0, epsilon = 1e-6);
        assert_abs_diff_eq!(params[1], 7.5 / 12.0, epsilon = 1e-6);
    }
}
