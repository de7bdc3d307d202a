//! Trigger policy published to the scheduler
//!
//! A policy tells the scheduler which ports must be ready before the module
//! is invoked again. Ports are grouped; every group must be satisfied, and
//! within a group either every must-fire port (`AllPorts`) or any one of them
//! (`AnyPort`) has to be ready.

use serde::{Deserialize, Serialize};

/// How a port participates in triggering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// Port readiness is required to trigger
    MustFire,
    /// Port may carry data but never triggers on its own
    Optional,
    /// Scheduler must not deliver to or take from this port
    Blocked,
    /// Port is closed
    NonExistent,
}

/// Combination rule inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    AllPorts,
    AnyPort,
}

/// Ports considered together
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerGroup {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Scheduler-visible trigger policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPolicy {
    pub mode: GroupMode,
    pub inputs: Vec<Affinity>,
    pub outputs: Vec<Affinity>,
    /// Empty means one group containing every port
    pub groups: Vec<TriggerGroup>,
}

impl TriggerPolicy {
    /// Every existing port must fire
    pub fn all_ports(inputs: Vec<Affinity>, outputs: Vec<Affinity>) -> Self {
        Self {
            mode: GroupMode::AllPorts,
            inputs,
            outputs,
            groups: Vec::new(),
        }
    }

    /// Any must-fire port triggers
    pub fn any_port(inputs: Vec<Affinity>, outputs: Vec<Affinity>) -> Self {
        Self {
            mode: GroupMode::AnyPort,
            inputs,
            outputs,
            groups: Vec::new(),
        }
    }

    /// Any input together with any output: `(in0 || in1 || ..) && (out0 || ..)`
    pub fn any_input_and_output(inputs: Vec<Affinity>, outputs: Vec<Affinity>) -> Self {
        let groups = vec![
            TriggerGroup {
                inputs: (0..inputs.len()).collect(),
                outputs: Vec::new(),
            },
            TriggerGroup {
                inputs: Vec::new(),
                outputs: (0..outputs.len()).collect(),
            },
        ];
        Self {
            mode: GroupMode::AnyPort,
            inputs,
            outputs,
            groups,
        }
    }

    /// Scheduler default: all inputs and all outputs required
    pub fn default_for(num_inputs: usize, num_outputs: usize) -> Self {
        Self::all_ports(
            vec![Affinity::MustFire; num_inputs],
            vec![Affinity::MustFire; num_outputs],
        )
    }

    pub fn input(&self, index: usize) -> Affinity {
        self.inputs.get(index).copied().unwrap_or(Affinity::NonExistent)
    }

    pub fn output(&self, index: usize) -> Affinity {
        self.outputs.get(index).copied().unwrap_or(Affinity::NonExistent)
    }

    /// Whether the module should be invoked given port readiness.
    ///
    /// A group without any must-fire member is ignored. A policy with no
    /// remaining group never triggers.
    pub fn is_satisfied(&self, ready_inputs: &[bool], ready_outputs: &[bool]) -> bool {
        let implicit;
        let groups: &[TriggerGroup] = if self.groups.is_empty() {
            implicit = [TriggerGroup {
                inputs: (0..self.inputs.len()).collect(),
                outputs: (0..self.outputs.len()).collect(),
            }];
            &implicit
        } else {
            &self.groups
        };

        let mut any_group = false;
        for group in groups {
            let members: Vec<bool> = group
                .inputs
                .iter()
                .filter(|&&i| self.input(i) == Affinity::MustFire)
                .map(|&i| ready_inputs.get(i).copied().unwrap_or(false))
                .chain(
                    group
                        .outputs
                        .iter()
                        .filter(|&&o| self.output(o) == Affinity::MustFire)
                        .map(|&o| ready_outputs.get(o).copied().unwrap_or(false)),
                )
                .collect();

            if members.is_empty() {
                continue;
            }
            any_group = true;

            let satisfied = match self.mode {
                GroupMode::AllPorts => members.iter().all(|&r| r),
                GroupMode::AnyPort => members.iter().any(|&r| r),
            };
            if !satisfied {
                return false;
            }
        }
        any_group
    }
}
