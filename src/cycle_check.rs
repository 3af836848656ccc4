use std::collections::VecDeque;

/// Returns one dependency cycle as a list of node indices, starting and
/// ending with the same node, or `None` if the graph is acyclic.
///
/// `dependencies[i]` lists the nodes `i` depends on.
pub fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut visited = vec![false; dependencies.len()];
    let mut on_path = vec![false; dependencies.len()];
    let mut path = Vec::new();

    fn dfs(
        node: usize,
        dependencies: &[Vec<usize>],
        visited: &mut [bool],
        on_path: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        if on_path[node] {
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if visited[node] {
            return None;
        }

        visited[node] = true;
        on_path[node] = true;
        path.push(node);

        for &dep in &dependencies[node] {
            if let Some(cycle) = dfs(dep, dependencies, visited, on_path, path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_path[node] = false;
        None
    }

    for node in 0..dependencies.len() {
        if !visited[node] {
            if let Some(cycle) = dfs(node, dependencies, &mut visited, &mut on_path, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

/// Kahn's algorithm over an acyclic graph. Ties are broken by index, so the
/// order is deterministic for a given graph.
pub fn topological_order(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degrees: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: VecDeque<usize> = (0..in_degrees.len())
        .filter(|&node| in_degrees[node] == 0)
        .collect();
    let mut order = Vec::with_capacity(in_degrees.len());

    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &child in &dependents[node] {
            in_degrees[child] -= 1;
            if in_degrees[child] == 0 {
                ready.push_back(child);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dependents(dependencies: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); dependencies.len()];
        for (node, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }
        dependents
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let deps = vec![vec![], vec![0], vec![0], vec![1, 2]];
        assert_eq!(find_cycle(&deps), None);
        assert_eq!(topological_order(&deps, &dependents(&deps)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let deps = vec![vec![], vec![1]];
        assert_eq!(find_cycle(&deps), Some(vec![1, 1]));
    }

    #[test]
    fn reports_the_cycle_path() {
        let deps = vec![vec![2], vec![0], vec![1], vec![]];
        assert_eq!(find_cycle(&deps), Some(vec![0, 2, 1, 0]));
    }

    #[test]
    fn topological_order_respects_edges() {
        let deps = vec![vec![3], vec![], vec![1, 0], vec![1]];
        let order = topological_order(&deps, &dependents(&deps));
        let position = |n: usize| order.iter().position(|&x| x == n).unwrap();

        assert_eq!(order.len(), 4);
        for (node, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                assert!(position(dep) < position(node));
            }
        }
    }
}
