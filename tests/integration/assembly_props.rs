//! Property tests for workflow assembly over generated job graphs.

use impress::testing::FixtureJobs;
use impress::{Assembler, ImpressionId, JobStatus, MachineId};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

/// A job graph where job `i` only depends on jobs `0..i`, plus which jobs
/// are already finished.
#[derive(Debug, Clone)]
struct Graph {
    deps: Vec<Vec<usize>>,
    finished: Vec<bool>,
}

fn graph_strategy(max_jobs: usize) -> impl Strategy<Value = Graph> {
    (1..=max_jobs).prop_flat_map(|jobs| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), jobs),
            proptest::collection::vec(proptest::bool::weighted(0.2), jobs),
        )
            .prop_map(|(raw, finished)| {
                let deps = raw
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let mut valid: Vec<usize> = if i == 0 {
                            Vec::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        };
                        valid.sort_unstable();
                        valid.dedup();
                        valid
                    })
                    .collect();
                Graph { deps, finished }
            })
    })
}

fn name(i: usize) -> String {
    format!("n{:06}", i)
}

/// Jobs reachable from `root` without descending below finished jobs.
fn reachable(graph: &Graph, root: usize) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(i) = stack.pop() {
        if !seen.insert(i) || graph.finished[i] {
            continue;
        }
        stack.extend(graph.deps[i].iter().copied());
    }
    seen
}

async fn assemble(graph: &Graph) -> Vec<ImpressionId> {
    let fixtures = FixtureJobs::new("p");
    for (i, deps) in graph.deps.iter().enumerate() {
        let job = fixtures
            .task(&name(i))
            .with_dependencies(deps.iter().map(|d| FixtureJobs::id(&name(*d))).collect());
        if graph.finished[i] {
            job.set_status(JobStatus::Finished).await.unwrap();
        }
        fixtures.insert(job);
    }

    let root = graph.deps.len() - 1;
    let root_job = fixtures.task(&name(root)).with_dependencies(
        graph.deps[root]
            .iter()
            .map(|d| FixtureJobs::id(&name(*d)))
            .collect(),
    );
    let machine = MachineId::new("m");
    Assembler::new(&fixtures, fixtures.project())
        .with_machine(&machine)
        .assemble(vec![root_job])
        .await
        .unwrap()
        .iter()
        .map(|job| job.id().clone())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_assembly_emits_reachable_jobs_once(graph in graph_strategy(12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let order = runtime.block_on(assemble(&graph));

        let unique: HashSet<&ImpressionId> = order.iter().collect();
        prop_assert_eq!(unique.len(), order.len());

        let expected: HashSet<ImpressionId> = reachable(&graph, graph.deps.len() - 1)
            .into_iter()
            .map(|i| FixtureJobs::id(&name(i)))
            .collect();
        let emitted: HashSet<ImpressionId> = order.iter().cloned().collect();
        prop_assert_eq!(emitted, expected);
    }

    #[test]
    fn test_assembly_orders_dependencies_first(graph in graph_strategy(12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let order = runtime.block_on(assemble(&graph));

        let position: HashMap<ImpressionId, usize> = order
            .iter()
            .enumerate()
            .map(|(at, id)| (id.clone(), at))
            .collect();
        for (i, deps) in graph.deps.iter().enumerate() {
            let Some(&at) = position.get(&FixtureJobs::id(&name(i))) else {
                continue;
            };
            if graph.finished[i] {
                continue;
            }
            for dep in deps {
                let dep_at = position.get(&FixtureJobs::id(&name(*dep)));
                prop_assert!(dep_at.is_some_and(|d| *d < at));
            }
        }
    }
}
