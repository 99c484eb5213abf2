//! Partitioning of discovered tests into slices for parallel agents.
//!
//! [`BatchPlanner::plan`] is pure: it only sees counts and optional
//! historical durations, and every slice it produces is a contiguous range
//! over either the assembly list or the discovered-test list.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Partitioning strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One slice per assembly.
    #[default]
    AssemblyBased,

    /// Fixed number of tests per slice.
    TestCaseCountBased,

    /// Fixed time budget per slice, from historical durations.
    ExecutionTimeBased,
}

impl BatchStrategy {
    /// Stable lowercase name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            BatchStrategy::AssemblyBased => "assembly_based",
            BatchStrategy::TestCaseCountBased => "test_case_count_based",
            BatchStrategy::ExecutionTimeBased => "execution_time_based",
        }
    }
}

/// The single rule that decided slice boundaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceSizing {
    PerAssembly,
    /// Caller-supplied tests per slice.
    FixedCount { size: usize },
    /// `ceil(discovered / agents)` tests per slice.
    EvenAcrossAgents { size: usize },
    /// Milliseconds of historical runtime per slice.
    TimeBudget { budget_ms: u64 },
}

/// What a slice's range indexes into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SliceUnit {
    Assemblies,
    TestCases,
}

/// A contiguous range of assemblies or discovered tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSlice {
    pub index: usize,
    pub unit: SliceUnit,
    pub start: usize,
    pub len: usize,
    pub estimated_ms: Option<u64>,
}

impl TestSlice {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Positions covered in discovery or assembly order.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }

    /// Items of `items` covered by this slice, clamped to its length.
    pub fn select<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.start.min(items.len());
        let end = (self.start + self.len).min(items.len());
        &items[start..end]
    }
}

/// Result of planning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPlan {
    /// Strategy actually applied, which may differ from the requested one.
    pub strategy: BatchStrategy,
    pub sizing: SliceSizing,
    pub agent_count: usize,
    pub slices: Vec<TestSlice>,
    pub warnings: Vec<String>,
}

impl BatchPlan {
    /// Whether the plan carries nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.slices.iter().all(TestSlice::is_empty)
    }

    /// Slices owned by one agent: slice `j` goes to agent `j % agent_count`.
    pub fn slices_for_agent(&self, agent_index: usize) -> impl Iterator<Item = &TestSlice> {
        let agents = self.agent_count.max(1);
        self.slices
            .iter()
            .filter(move |s| s.index % agents == agent_index)
    }
}

/// Inputs to [`BatchPlanner::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub total_agents: i64,
    pub strategy: BatchStrategy,
    pub size_hint: Option<u64>,
    pub discovered_count: usize,
    pub assembly_count: usize,
    /// Historical duration per discovered test, in discovery order.
    pub durations: Option<Vec<Option<u64>>>,
}

impl PlanRequest {
    /// A request with no assembly count and no timing history.
    pub fn new(
        total_agents: i64,
        strategy: BatchStrategy,
        size_hint: Option<u64>,
        discovered_count: usize,
    ) -> Self {
        Self {
            total_agents,
            strategy,
            size_hint,
            discovered_count,
            assembly_count: 0,
            durations: None,
        }
    }

    /// Number of test sources, used by assembly-based plans.
    pub fn with_assemblies(mut self, count: usize) -> Self {
        self.assembly_count = count;
        self
    }

    /// Historical duration per discovered test, in discovery order.
    pub fn with_durations(mut self, durations: Vec<Option<u64>>) -> Self {
        self.durations = Some(durations);
        self
    }
}

/// Batch planner.
pub struct BatchPlanner;

impl BatchPlanner {
    /// Partition the discovered tests. Never fails; degraded plans carry warnings.
    pub fn plan(request: &PlanRequest) -> BatchPlan {
        let mut warnings = Vec::new();

        let agent_count = if request.total_agents <= 0 {
            let msg = format!(
                "agent count {} is not positive, planning for a single agent",
                request.total_agents
            );
            warn!("{msg}");
            warnings.push(msg);
            1
        } else {
            usize::try_from(request.total_agents).unwrap_or(usize::MAX)
        };

        if request.discovered_count == 0 {
            return BatchPlan {
                strategy: request.strategy,
                sizing: SliceSizing::EvenAcrossAgents { size: 0 },
                agent_count,
                slices: vec![TestSlice {
                    index: 0,
                    unit: SliceUnit::TestCases,
                    start: 0,
                    len: 0,
                    estimated_ms: None,
                }],
                warnings,
            };
        }

        let hint = request.size_hint.filter(|h| *h > 0);

        match request.strategy {
            BatchStrategy::AssemblyBased if request.assembly_count > 0 => BatchPlan {
                strategy: BatchStrategy::AssemblyBased,
                sizing: SliceSizing::PerAssembly,
                agent_count,
                slices: (0..request.assembly_count)
                    .map(|i| TestSlice {
                        index: i,
                        unit: SliceUnit::Assemblies,
                        start: i,
                        len: 1,
                        estimated_ms: None,
                    })
                    .collect(),
                warnings,
            },
            BatchStrategy::AssemblyBased => {
                let msg = "no assemblies known, planning by test count".to_string();
                warn!("{msg}");
                warnings.push(msg);
                Self::plan_by_count(request.discovered_count, agent_count, None, warnings)
            }
            BatchStrategy::TestCaseCountBased => {
                Self::plan_by_count(request.discovered_count, agent_count, hint, warnings)
            }
            BatchStrategy::ExecutionTimeBased => {
                let known = request
                    .durations
                    .as_ref()
                    .map(|d| d.iter().flatten().count())
                    .unwrap_or(0);
                match &request.durations {
                    Some(durations) if known > 0 => Self::plan_by_time(
                        request.discovered_count,
                        agent_count,
                        durations,
                        hint,
                        warnings,
                    ),
                    _ => {
                        let msg =
                            "no historical timing data, planning by test count instead".to_string();
                        warn!("{msg}");
                        warnings.push(msg);
                        Self::plan_by_count(request.discovered_count, agent_count, None, warnings)
                    }
                }
            }
        }
    }

    fn plan_by_count(
        discovered: usize,
        agent_count: usize,
        hint: Option<u64>,
        warnings: Vec<String>,
    ) -> BatchPlan {
        let sizing = match hint {
            Some(size) => SliceSizing::FixedCount {
                size: usize::try_from(size).unwrap_or(usize::MAX),
            },
            None => SliceSizing::EvenAcrossAgents {
                size: discovered.div_ceil(agent_count),
            },
        };
        let size = match sizing {
            SliceSizing::FixedCount { size } | SliceSizing::EvenAcrossAgents { size } => size,
            _ => discovered,
        }
        .max(1);

        let slices = (0..discovered)
            .step_by(size)
            .enumerate()
            .map(|(index, start)| TestSlice {
                index,
                unit: SliceUnit::TestCases,
                start,
                len: size.min(discovered - start),
                estimated_ms: None,
            })
            .collect();

        BatchPlan {
            strategy: BatchStrategy::TestCaseCountBased,
            sizing,
            agent_count,
            slices,
            warnings,
        }
    }

    fn plan_by_time(
        discovered: usize,
        agent_count: usize,
        durations: &[Option<u64>],
        hint: Option<u64>,
        warnings: Vec<String>,
    ) -> BatchPlan {
        let known: Vec<u64> = durations.iter().flatten().copied().collect();
        let mean = known.iter().sum::<u64>() / known.len().max(1) as u64;
        let cost: Vec<u64> = (0..discovered)
            .map(|i| durations.get(i).copied().flatten().unwrap_or(mean))
            .collect();

        let total: u64 = cost.iter().sum();
        let budget_ms = hint.unwrap_or_else(|| total.div_ceil(agent_count as u64)).max(1);

        let mut slices = Vec::new();
        let mut start = 0;
        let mut acc = 0u64;
        for (i, c) in cost.iter().enumerate() {
            if i > start && acc + c > budget_ms {
                slices.push(TestSlice {
                    index: slices.len(),
                    unit: SliceUnit::TestCases,
                    start,
                    len: i - start,
                    estimated_ms: Some(acc),
                });
                start = i;
                acc = 0;
            }
            acc += c;
        }
        slices.push(TestSlice {
            index: slices.len(),
            unit: SliceUnit::TestCases,
            start,
            len: discovered - start,
            estimated_ms: Some(acc),
        });

        BatchPlan {
            strategy: BatchStrategy::ExecutionTimeBased,
            sizing: SliceSizing::TimeBudget { budget_ms },
            agent_count,
            slices,
            warnings,
        }
    }
}
