//! Maximum spanning arborescence decoding over arc scores.

const NEG_INF: f64 = f64::NEG_INFINITY;

/// Chu-Liu/Edmonds over `scores[dep][head]`, node 0 being the root.
/// Returns `heads` with `heads[0] == 0`; self-loops are never chosen.
pub fn chu_liu_edmonds(scores: &[Vec<f64>]) -> Vec<usize> {
    let n = scores.len();
    let mut heads = vec![0usize; n];
    for dep in 1..n {
        heads[dep] = best_head(&scores[dep], dep);
    }
    let Some(cycle) = find_cycle(&heads) else {
        return heads;
    };

    let mut in_cycle = vec![false; n];
    for &node in &cycle {
        in_cycle[node] = true;
    }
    let outside: Vec<usize> = (0..n).filter(|&node| !in_cycle[node]).collect();
    let contracted_node = outside.len();
    let size = contracted_node + 1;

    let mut contracted = vec![vec![NEG_INF; size]; size];
    // for an outside dependent attached to the cycle: which cycle node heads it
    let mut leaving = vec![0usize; size];
    // for an outside head of the cycle: which cycle node it enters at
    let mut entering = vec![0usize; size];

    for (new_dep, &dep) in outside.iter().enumerate() {
        for (new_head, &head) in outside.iter().enumerate() {
            if new_dep != new_head {
                contracted[new_dep][new_head] = scores[dep][head];
            }
        }
        let (head, score) = cycle
            .iter()
            .map(|&head| (head, scores[dep][head]))
            .fold((cycle[0], NEG_INF), |best, cand| if cand.1 > best.1 { cand } else { best });
        contracted[new_dep][contracted_node] = score;
        leaving[new_dep] = head;
    }
    for (new_head, &head) in outside.iter().enumerate() {
        let (dep, score) = cycle
            .iter()
            .map(|&dep| (dep, scores[dep][head] - scores[dep][heads[dep]]))
            .fold((cycle[0], NEG_INF), |best, cand| if cand.1 > best.1 { cand } else { best });
        contracted[contracted_node][new_head] = score;
        entering[new_head] = dep;
    }

    let sub_heads = chu_liu_edmonds(&contracted);
    let mut result = heads;
    for (new_dep, &dep) in outside.iter().enumerate().skip(1) {
        let new_head = sub_heads[new_dep];
        result[dep] = if new_head == contracted_node {
            leaving[new_dep]
        } else {
            outside[new_head]
        };
    }
    let cycle_head = sub_heads[contracted_node];
    result[entering[cycle_head]] = outside[cycle_head];
    result
}

/// Best tree in which exactly one token attaches to the root. `scores` is
/// `[n][n]` over ROOT plus tokens; row 0 is ignored.
pub fn decode_tree(scores: &[Vec<f64>]) -> Vec<usize> {
    let n = scores.len();
    let mut scores = scores.to_vec();
    for (dep, row) in scores.iter_mut().enumerate() {
        row[dep] = NEG_INF;
    }
    let heads = chu_liu_edmonds(&scores);
    let root_children: Vec<usize> = (1..n).filter(|&dep| heads[dep] == 0).collect();
    if root_children.len() <= 1 {
        return heads;
    }

    root_children
        .iter()
        .map(|&root_child| {
            let mut constrained = scores.clone();
            for (dep, row) in constrained.iter_mut().enumerate().skip(1) {
                if dep != root_child {
                    row[0] = NEG_INF;
                }
            }
            let candidate = chu_liu_edmonds(&constrained);
            (tree_score(&scores, &candidate), candidate)
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map_or(heads, |(_, candidate)| candidate)
}

pub fn tree_score(scores: &[Vec<f64>], heads: &[usize]) -> f64 {
    heads
        .iter()
        .enumerate()
        .skip(1)
        .map(|(dep, &head)| scores[dep][head])
        .sum()
}

fn best_head(row: &[f64], dep: usize) -> usize {
    row.iter()
        .enumerate()
        .filter(|(head, _)| *head != dep)
        .fold((0, NEG_INF), |best, (head, &score)| {
            if score > best.1 { (head, score) } else { best }
        })
        .0
}

fn find_cycle(heads: &[usize]) -> Option<Vec<usize>> {
    const UNSEEN: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNSEEN; heads.len()];
    if let Some(root) = state.first_mut() {
        *root = DONE;
    }
    for start in 1..heads.len() {
        let mut path = Vec::new();
        let mut node = start;
        while state[node] == UNSEEN {
            state[node] = ON_PATH;
            path.push(node);
            node = heads[node];
        }
        if state[node] == ON_PATH {
            let from = path.iter().position(|&p| p == node)?;
            return Some(path[from..].to_vec());
        }
        for p in path {
            state[p] = DONE;
        }
    }
    None
}
