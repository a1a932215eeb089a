use crate::error::StorageError;
use crate::fingerprint::Fingerprint;
use crate::graph::{StateGraphStore, pack_label};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Tableau automaton node id, local to one property.
pub type NodeId = u16;

/// A temporal property pre-compiled into a Büchi-style tableau automaton by
/// the external collaborator.
///
/// The transition relation factors into a static successor relation over
/// tableau nodes plus a per-state consistency predicate: node `t'` is a
/// legal successor of `t` in state `s'` iff `t' ∈ succ(t)` and `s'` is
/// consistent with `t'`. The property is violated iff a reachable cycle of
/// the product graph visits an accepting node.
pub struct TableauAutomaton<S> {
    pub name: String,
    initial: Vec<NodeId>,
    accepting: Vec<NodeId>,
    succ: Vec<Vec<NodeId>>,
    consistent: Arc<dyn Fn(NodeId, &S) -> bool + Send + Sync>,
}

impl<S> TableauAutomaton<S> {
    pub fn new(
        name: impl Into<String>,
        succ: Vec<Vec<NodeId>>,
        initial: Vec<NodeId>,
        accepting: Vec<NodeId>,
        consistent: impl Fn(NodeId, &S) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            initial,
            accepting,
            succ,
            consistent: Arc::new(consistent),
        }
    }

    /// Negation automaton for `<>P`: an accepting lasso is a behavior on
    /// which P never holds.
    pub fn eventually(name: impl Into<String>, p: impl Fn(&S) -> bool + Send + Sync + 'static) -> Self {
        Self::new(name, vec![vec![0]], vec![0], vec![0], move |_, state| !p(state))
    }

    /// Negation automaton for `[]<>P`: an accepting lasso eventually settles
    /// into states where P never holds again.
    pub fn infinitely_often(
        name: impl Into<String>,
        p: impl Fn(&S) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            name,
            vec![vec![0, 1], vec![1]],
            vec![0, 1],
            vec![1],
            move |node, state| node == 0 || !p(state),
        )
    }

    /// Negation automaton for `<>[]P`: an accepting lasso visits `~P`
    /// states infinitely often.
    pub fn eventually_always(
        name: impl Into<String>,
        p: impl Fn(&S) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            name,
            vec![vec![0, 1], vec![0, 1]],
            vec![0, 1],
            vec![1],
            move |node, state| node == 0 || !p(state),
        )
    }

    pub fn node_count(&self) -> usize {
        self.succ.len()
    }

    pub fn initial(&self) -> &[NodeId] {
        &self.initial
    }

    pub fn is_accepting(&self, node: NodeId) -> bool {
        self.accepting.contains(&node)
    }

    /// Tableau nodes consistent with a state; recorded as the state's labels
    /// at discovery time.
    pub fn labels_for(&self, state: &S) -> Vec<NodeId> {
        (0..self.succ.len() as NodeId)
            .filter(|node| (self.consistent)(*node, state))
            .collect()
    }

    /// Automaton transition: possible next nodes given the concrete
    /// successor state.
    pub fn transition(&self, from: NodeId, successor: &S) -> Vec<NodeId> {
        self.succ
            .get(from as usize)
            .map(|nodes| {
                nodes
                    .iter()
                    .copied()
                    .filter(|node| (self.consistent)(*node, successor))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn static_successors(&self, from: NodeId) -> &[NodeId] {
        self.succ.get(from as usize).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A reachable accepting lasso: evidence that one temporal property fails.
#[derive(Debug, Clone)]
pub struct LivenessViolation {
    pub property: String,
    /// Path from an initial state to the cycle entry, inclusive.
    pub prefix: Vec<Fingerprint>,
    /// The cycle, starting at the entry state; the behavior repeats it
    /// forever. The entry is not repeated at the end.
    pub cycle: Vec<Fingerprint>,
}

/// Incremental cycle detector over the tableau product graphs.
///
/// May be run on a partially explored graph: a violation found early is
/// genuine (every product edge mirrors a real transition), but "no
/// violation" is only authoritative once the state graph is fully explored.
pub struct LivenessChecker<S> {
    automata: Vec<TableauAutomaton<S>>,
}

type ProductNode = (u64, NodeId);

impl<S> LivenessChecker<S> {
    pub fn new(automata: Vec<TableauAutomaton<S>>) -> Self {
        Self { automata }
    }

    pub fn is_empty(&self) -> bool {
        self.automata.is_empty()
    }

    pub fn automata(&self) -> &[TableauAutomaton<S>] {
        &self.automata
    }

    /// Packed labels of a state across every property, stored in its
    /// `StateRecord` at discovery time.
    pub fn labels_for_state(&self, state: &S) -> Vec<u32> {
        let mut labels = Vec::new();
        for (property, automaton) in self.automata.iter().enumerate() {
            for node in automaton.labels_for(state) {
                labels.push(pack_label(property as u16, node));
            }
        }
        labels
    }

    /// Search every property's product graph for a reachable accepting
    /// cycle. Records not yet written by workers are treated as unexplored
    /// and skipped, never as an error.
    pub fn check(
        &self,
        graph: &StateGraphStore,
        init: &[Fingerprint],
    ) -> Result<Option<LivenessViolation>, StorageError> {
        for (property, automaton) in self.automata.iter().enumerate() {
            if let Some(violation) = self.check_property(graph, init, property as u16, automaton)? {
                return Ok(Some(violation));
            }
        }
        Ok(None)
    }

    fn check_property(
        &self,
        graph: &StateGraphStore,
        init: &[Fingerprint],
        property: u16,
        automaton: &TableauAutomaton<S>,
    ) -> Result<Option<LivenessViolation>, StorageError> {
        let label_of = |node: NodeId| pack_label(property, node);

        // Reachable product nodes, discovered by BFS from the initial ones.
        // Parents are kept for prefix reconstruction.
        let mut adjacency: HashMap<ProductNode, Vec<ProductNode>> = HashMap::new();
        let mut parent: HashMap<ProductNode, ProductNode> = HashMap::new();
        let mut frontier: VecDeque<ProductNode> = VecDeque::new();

        for fp in init {
            let Some(record) = graph.record(*fp)? else {
                continue;
            };
            for node in automaton.initial() {
                if record.labels.contains(&label_of(*node)) {
                    let root = (fp.raw(), *node);
                    if !adjacency.contains_key(&root) {
                        adjacency.insert(root, Vec::new());
                        frontier.push_back(root);
                    }
                }
            }
        }

        while let Some(current) = frontier.pop_front() {
            let (fp, node) = current;
            let mut out = Vec::new();
            for succ_fp in graph.successors(Fingerprint(fp)) {
                let Some(succ_record) = graph.record(succ_fp)? else {
                    // Discovered but not yet recorded: unexplored, retried on
                    // the next pass.
                    continue;
                };
                for next_node in automaton.static_successors(node) {
                    if succ_record.labels.contains(&label_of(*next_node)) {
                        let next = (succ_fp.raw(), *next_node);
                        out.push(next);
                        if !adjacency.contains_key(&next) {
                            adjacency.insert(next, Vec::new());
                            parent.insert(next, current);
                            frontier.push_back(next);
                        }
                    }
                }
            }
            adjacency.insert(current, out);
        }

        if adjacency.is_empty() {
            return Ok(None);
        }

        for scc in tarjan_sccs(&adjacency) {
            let non_trivial = scc.len() > 1
                || adjacency
                    .get(&scc[0])
                    .is_some_and(|out| out.contains(&scc[0]));
            if !non_trivial {
                continue;
            }
            let Some(entry) = scc
                .iter()
                .copied()
                .find(|(_, node)| automaton.is_accepting(*node))
            else {
                continue;
            };

            let scc_set: HashSet<ProductNode> = scc.iter().copied().collect();
            let cycle = cycle_through(&adjacency, &scc_set, entry);
            let mut prefix = vec![entry];
            let mut cursor = entry;
            while let Some(prev) = parent.get(&cursor) {
                prefix.push(*prev);
                cursor = *prev;
            }
            prefix.reverse();

            return Ok(Some(LivenessViolation {
                property: automaton.name.clone(),
                prefix: prefix.into_iter().map(|(fp, _)| Fingerprint(fp)).collect(),
                cycle: cycle.into_iter().map(|(fp, _)| Fingerprint(fp)).collect(),
            }));
        }

        Ok(None)
    }
}

/// Iterative Tarjan decomposition; recursion would overflow on the deep
/// product graphs large searches produce.
fn tarjan_sccs(
    adjacency: &HashMap<ProductNode, Vec<ProductNode>>,
) -> Vec<Vec<ProductNode>> {
    struct Frame {
        node: ProductNode,
        edge: usize,
    }

    let mut index: HashMap<ProductNode, usize> = HashMap::new();
    let mut lowlink: HashMap<ProductNode, usize> = HashMap::new();
    let mut on_stack: HashSet<ProductNode> = HashSet::new();
    let mut stack: Vec<ProductNode> = Vec::new();
    let mut sccs: Vec<Vec<ProductNode>> = Vec::new();
    let mut counter = 0usize;

    for start in adjacency.keys() {
        if index.contains_key(start) {
            continue;
        }
        let mut frames = vec![Frame {
            node: *start,
            edge: 0,
        }];
        index.insert(*start, counter);
        lowlink.insert(*start, counter);
        counter += 1;
        stack.push(*start);
        on_stack.insert(*start);

        while let Some(frame) = frames.last_mut() {
            let node = frame.node;
            let edges = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if frame.edge < edges.len() {
                let next = edges[frame.edge];
                frame.edge += 1;
                if !index.contains_key(&next) {
                    index.insert(next, counter);
                    lowlink.insert(next, counter);
                    counter += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    frames.push(Frame {
                        node: next,
                        edge: 0,
                    });
                } else if on_stack.contains(&next) {
                    let next_index = index[&next];
                    let low = lowlink.get_mut(&node).expect("visited node has lowlink");
                    *low = (*low).min(next_index);
                }
            } else {
                let finished = frames.pop().expect("frame exists").node;
                if lowlink[&finished] == index[&finished] {
                    let mut scc = Vec::new();
                    loop {
                        let member = stack.pop().expect("scc member on stack");
                        on_stack.remove(&member);
                        scc.push(member);
                        if member == finished {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
                if let Some(parent_frame) = frames.last() {
                    let child_low = lowlink[&finished];
                    let low = lowlink
                        .get_mut(&parent_frame.node)
                        .expect("parent has lowlink");
                    *low = (*low).min(child_low);
                }
            }
        }
    }

    sccs
}

/// Find a cycle through `entry` using only nodes of its SCC. Such a cycle
/// exists because the SCC is non-trivial (or `entry` has a self-loop).
fn cycle_through(
    adjacency: &HashMap<ProductNode, Vec<ProductNode>>,
    scc: &HashSet<ProductNode>,
    entry: ProductNode,
) -> Vec<ProductNode> {
    let mut path = vec![entry];
    let mut visited = HashSet::from([entry]);
    let mut frames: Vec<(ProductNode, usize)> = vec![(entry, 0)];

    while let Some((node, edge)) = frames.last_mut() {
        let edges = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
        if *edge < edges.len() {
            let next = edges[*edge];
            *edge += 1;
            if next == entry {
                return path;
            }
            if scc.contains(&next) && visited.insert(next) {
                path.push(next);
                frames.push((next, 0));
            }
        } else {
            frames.pop();
            path.pop();
        }
    }

    // Unreachable for a well-formed non-trivial SCC; degrade to a self-loop.
    vec![entry]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStoreConfig, StateRecord};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("veristate-{prefix}-{nanos}-{}", std::process::id()))
    }

    /// Build a graph store holding the given edges, with labels computed the
    /// way workers compute them. States are identified with their raw
    /// fingerprints, and the consistency predicates look at that number.
    fn synthetic_graph(
        prefix: &str,
        checker: &LivenessChecker<u64>,
        init: &[u64],
        edges: &[(u64, &[u64])],
    ) -> (StateGraphStore, PathBuf) {
        let path = temp_path(prefix);
        let graph = StateGraphStore::open(GraphStoreConfig {
            path: path.clone(),
            track_edges: true,
            cache_capacity_bytes: 8 * 1024 * 1024,
        })
        .expect("graph store should open");

        let mut recorded = std::collections::HashSet::new();
        let mut record = |fp: u64, predecessor: Option<u64>| {
            if recorded.insert(fp) {
                graph
                    .insert_record(
                        Fingerprint(fp),
                        &StateRecord {
                            predecessor: predecessor.map(Fingerprint),
                            labels: checker.labels_for_state(&fp),
                        },
                    )
                    .unwrap();
            }
        };
        for fp in init {
            record(*fp, None);
        }
        for (from, successors) in edges {
            for to in *successors {
                record(*to, Some(*from));
            }
        }
        for (from, successors) in edges {
            let fps: Vec<Fingerprint> = successors.iter().map(|fp| Fingerprint(*fp)).collect();
            graph.record_edges(Fingerprint(*from), &fps).unwrap();
        }
        (graph, path)
    }

    #[test]
    fn accepting_cycle_is_reported_with_its_lasso() {
        // 0 -> 1 -> 2 -> 1, P holds nowhere: <>P is violated by the
        // cycle {1, 2}.
        let checker =
            LivenessChecker::new(vec![TableauAutomaton::eventually("reaches-goal", |fp: &u64| {
                *fp == 99
            })]);
        let (graph, path) = synthetic_graph(
            "live-pos",
            &checker,
            &[0],
            &[(0, &[1][..]), (1, &[2][..]), (2, &[1][..])],
        );

        let violation = checker
            .check(&graph, &[Fingerprint(0)])
            .unwrap()
            .expect("cycle should be found");
        assert_eq!(violation.property, "reaches-goal");
        assert_eq!(violation.prefix.first(), Some(&Fingerprint(0)));
        assert_eq!(violation.prefix.last(), Some(violation.cycle.first().unwrap()));
        let cycle: std::collections::HashSet<u64> =
            violation.cycle.iter().map(|fp| fp.raw()).collect();
        assert_eq!(cycle, std::collections::HashSet::from([1, 2]));

        drop(graph);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn no_accepting_cycle_means_no_violation() {
        // Same shape, but P holds inside the cycle, so []<>P is satisfied.
        let checker = LivenessChecker::new(vec![TableauAutomaton::infinitely_often(
            "visits-two",
            |fp: &u64| *fp == 2,
        )]);
        let (graph, path) = synthetic_graph(
            "live-neg",
            &checker,
            &[0],
            &[(0, &[1][..]), (1, &[2][..]), (2, &[1][..])],
        );

        assert!(checker.check(&graph, &[Fingerprint(0)]).unwrap().is_none());

        drop(graph);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn unreachable_cycles_are_ignored() {
        // The bad cycle {7, 8} exists but nothing reaches it.
        let checker =
            LivenessChecker::new(vec![TableauAutomaton::eventually("reaches-goal", |fp: &u64| {
                *fp == 99
            })]);
        let (graph, path) = synthetic_graph(
            "live-unreach",
            &checker,
            &[0],
            &[(0, &[99][..]), (7, &[8][..]), (8, &[7][..])],
        );

        assert!(checker.check(&graph, &[Fingerprint(0)]).unwrap().is_none());

        drop(graph);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn self_loop_counts_as_a_cycle() {
        let checker =
            LivenessChecker::new(vec![TableauAutomaton::eventually("reaches-goal", |fp: &u64| {
                *fp == 99
            })]);
        let (graph, path) =
            synthetic_graph("live-self", &checker, &[0], &[(0, &[0][..])]);

        let violation = checker
            .check(&graph, &[Fingerprint(0)])
            .unwrap()
            .expect("self-loop is an accepting cycle");
        assert_eq!(violation.cycle, vec![Fingerprint(0)]);

        drop(graph);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn eventually_always_violated_by_recurring_exit() {
        // 0 -> 1 -> 0: P holds only in 1, so <>[]P fails because ~P recurs.
        let checker = LivenessChecker::new(vec![TableauAutomaton::eventually_always(
            "settles-in-goal",
            |fp: &u64| *fp == 1,
        )]);
        let (graph, path) = synthetic_graph(
            "live-evalw",
            &checker,
            &[0],
            &[(0, &[1][..]), (1, &[0][..])],
        );

        let violation = checker
            .check(&graph, &[Fingerprint(0)])
            .unwrap()
            .expect("recurring ~P state should violate <>[]P");
        assert_eq!(violation.property, "settles-in-goal");

        drop(graph);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn transition_filters_static_successors_by_consistency() {
        let automaton = TableauAutomaton::infinitely_often("visits-goal", |fp: &u64| *fp == 1);
        assert_eq!(automaton.labels_for(&0), vec![0, 1]);
        assert_eq!(automaton.labels_for(&1), vec![0]);
        assert_eq!(automaton.transition(0, &0), vec![0, 1]);
        assert_eq!(automaton.transition(0, &1), vec![0]);
        assert_eq!(automaton.transition(1, &1), Vec::<NodeId>::new());
        assert!(automaton.is_accepting(1));
        assert!(!automaton.is_accepting(0));
    }

    #[test]
    fn tarjan_groups_components_correctly() {
        let adjacency: HashMap<ProductNode, Vec<ProductNode>> = HashMap::from([
            (((1, 0)), vec![(2, 0)]),
            (((2, 0)), vec![(3, 0)]),
            (((3, 0)), vec![(2, 0)]),
            (((4, 0)), vec![(5, 0)]),
            (((5, 0)), vec![]),
        ]);
        let sccs = tarjan_sccs(&adjacency);
        let cycle = sccs
            .iter()
            .find(|scc| scc.len() == 2)
            .expect("the {2,3} component");
        let members: HashSet<u64> = cycle.iter().map(|(fp, _)| *fp).collect();
        assert_eq!(members, HashSet::from([2, 3]));
        assert_eq!(sccs.iter().map(Vec::len).sum::<usize>(), 5);
    }
}
