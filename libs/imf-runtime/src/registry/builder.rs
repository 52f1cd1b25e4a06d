//! Registration-time validation and start-order resolution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use super::{RegistryError, ServiceDescriptor, ServiceRegistry};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Collects descriptors and resolves them into a [`ServiceRegistry`].
///
/// Descriptors are validated as they arrive: a duplicate name or a dependency
/// edge that closes a cycle is rejected by [`register`](Self::register), so the
/// accumulated graph is acyclic at all times. Dependencies on names that are
/// not registered yet are allowed until [`build`](Self::build).
pub struct RegistryBuilder {
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
    probe_timeout: Duration,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            index: HashMap::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Upper bound for a single health probe.
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        let name = descriptor.name();
        if self.index.contains_key(name) {
            return Err(RegistryError::DuplicateService {
                name: name.to_owned(),
            });
        }

        for dep in descriptor.depends_on() {
            let mut path = vec![name.to_owned()];
            let mut visited = HashSet::new();
            if self.path_to(dep, name, &mut path, &mut visited) {
                tracing::error!(service = %name, cycle = %path.join(" -> "), "dependency cycle rejected");
                return Err(RegistryError::CyclicDependency { path });
            }
        }

        self.index
            .insert(name.to_owned(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Chained form of [`register`](Self::register).
    pub fn with(mut self, descriptor: ServiceDescriptor) -> Result<Self, RegistryError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Depth-first walk along dependency edges looking for `target`.
    /// On success `path` holds the walk from the new descriptor back to itself.
    fn path_to(
        &self,
        from: &str,
        target: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> bool {
        if from == target {
            path.push(from.to_owned());
            return true;
        }
        if !visited.insert(from.to_owned()) {
            return false;
        }
        let Some(&idx) = self.index.get(from) else {
            return false;
        };

        path.push(from.to_owned());
        for dep in self.descriptors[idx].depends_on() {
            if self.path_to(dep, target, path, visited) {
                return true;
            }
        }
        path.pop();
        false
    }

    /// Validates that every dependency exists and sorts the descriptors.
    ///
    /// The order is a topological sort in which, among the services whose
    /// dependencies are already placed, the earliest registered comes first.
    pub fn build(self) -> Result<ServiceRegistry, RegistryError> {
        let n = self.descriptors.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, descriptor) in self.descriptors.iter().enumerate() {
            for dep in descriptor.depends_on() {
                let Some(&dep_idx) = self.index.get(dep.as_str()) else {
                    return Err(RegistryError::MissingDependency {
                        service: descriptor.name().to_owned(),
                        dependency: dep.clone(),
                    });
                };
                in_degree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != n {
            // Unreachable through `register`, kept for graphs assembled elsewhere.
            let path = (0..n)
                .filter(|i| in_degree[*i] > 0)
                .map(|i| self.descriptors[i].name().to_owned())
                .collect();
            return Err(RegistryError::CyclicDependency { path });
        }

        let mut slots: Vec<Option<ServiceDescriptor>> =
            self.descriptors.into_iter().map(Some).collect();
        let sorted = order
            .into_iter()
            .filter_map(|idx| slots[idx].take())
            .collect::<Vec<_>>();

        tracing::debug!(
            order = %sorted.iter().map(ServiceDescriptor::name).collect::<Vec<_>>().join(", "),
            "resolved service start order"
        );

        Ok(ServiceRegistry::from_sorted(sorted, self.probe_timeout))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::contracts::Service;
    use std::sync::Arc;

    struct Noop;
    impl Service for Noop {}

    fn desc(name: &str, deps: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor::new(name, deps, |_ctx| async {
            Ok(Arc::new(Noop) as Arc<dyn Service>)
        })
    }

    fn order_of(builder: RegistryBuilder) -> Vec<String> {
        builder
            .build()
            .unwrap()
            .start_order()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = RegistryBuilder::new();
        b.register(desc("a", &[])).unwrap();
        let err = b.register(desc("a", &[])).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateService { ref name } if name == "a"));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut b = RegistryBuilder::new();
        let err = b.register(desc("a", &["a"])).unwrap_err();
        match err {
            RegistryError::CyclicDependency { path } => assert_eq!(path, vec!["a", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_closed_by_late_registration_is_rejected() {
        let mut b = RegistryBuilder::new();
        b.register(desc("a", &["c"])).unwrap();
        b.register(desc("b", &["a"])).unwrap();
        let err = b.register(desc("c", &["b"])).unwrap_err();
        match err {
            RegistryError::CyclicDependency { path } => {
                assert_eq!(path, vec!["c", "b", "a", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The rejected descriptor is not kept.
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn missing_dependency_fails_build() {
        let mut b = RegistryBuilder::new();
        b.register(desc("api", &["db"])).unwrap();
        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MissingDependency { ref service, ref dependency }
                if service == "api" && dependency == "db"
        ));
    }

    #[test]
    fn ties_are_broken_by_registration_order() {
        let b = RegistryBuilder::new()
            .with(desc("c", &[]))
            .unwrap()
            .with(desc("b", &[]))
            .unwrap()
            .with(desc("a", &[]))
            .unwrap();
        assert_eq!(order_of(b), vec!["c", "b", "a"]);
    }

    #[test]
    fn dependents_follow_their_dependencies() {
        let b = RegistryBuilder::new()
            .with(desc("api", &["db", "cache"]))
            .unwrap()
            .with(desc("worker", &["db"]))
            .unwrap()
            .with(desc("db", &[]))
            .unwrap()
            .with(desc("cache", &[]))
            .unwrap();
        assert_eq!(order_of(b), vec!["db", "worker", "cache", "api"]);
    }

    #[test]
    fn repeated_dependency_is_counted_once() {
        let b = RegistryBuilder::new()
            .with(desc("a", &[]))
            .unwrap()
            .with(desc("b", &["a", "a"]))
            .unwrap();
        assert_eq!(order_of(b), vec!["a", "b"]);
    }
}
