//! Canonical host sets and change detection.

use std::collections::BTreeSet;
use std::fmt;

use crate::membership::Instance;

/// Deduplicated set of eligible backend addresses.
///
/// Equality is set equality. Iteration is in ascending lexicographic order of
/// the address string, which is the projection used for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HostSet(BTreeSet<String>);

impl HostSet {
    /// Reduce candidate instances to the set of addresses that may receive
    /// traffic.
    pub fn reduce<'a, I>(instances: I) -> Self
    where
        I: IntoIterator<Item = &'a Instance>,
    {
        instances
            .into_iter()
            .filter_map(Instance::eligible_address)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.contains(address)
    }

    /// Addresses in rendering order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Addresses in rendering order, owned.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for HostSet {
    /// Collect addresses, dropping empty ones.
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|addr| addr.as_ref().trim().to_string())
                .filter(|addr| !addr.is_empty())
                .collect(),
        )
    }
}

impl fmt::Display for HostSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, host) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(host)?;
        }
        Ok(())
    }
}

/// Whether `current` requires a publish relative to `previous`.
///
/// True when nothing was published yet or the sets differ.
pub fn has_changed(current: &HostSet, previous: Option<&HostSet>) -> bool {
    previous != Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Phase;

    fn running(id: &str, host: &str) -> Instance {
        Instance::new(id, Some(host), Phase::Running)
    }

    #[test]
    fn test_reduce_filters_and_dedups() {
        let instances = vec![
            running("a", "10.0.0.2"),
            running("b", "10.0.0.1"),
            running("c", "10.0.0.2"),
            Instance::new("d", Some("10.0.0.3"), Phase::Pending),
            Instance::new("e", None, Phase::Running),
            running("f", ""),
        ];

        let hosts = HostSet::reduce(&instances);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts.to_vec(), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(!hosts.contains("10.0.0.3"));
    }

    #[test]
    fn test_reduce_empty_when_nothing_running() {
        let instances = vec![
            Instance::new("a", Some("10.0.0.1"), Phase::Failed),
            Instance::new("b", Some("10.0.0.2"), Phase::Succeeded),
        ];
        assert!(HostSet::reduce(&instances).is_empty());
        assert!(HostSet::reduce(&[]).is_empty());
    }

    #[test]
    fn test_order_is_not_significant() {
        let forward: HostSet = ["10.0.0.1", "10.0.0.2", "10.0.0.3"].into_iter().collect();
        let backward: HostSet = ["10.0.0.3", "10.0.0.2", "10.0.0.1"].into_iter().collect();
        assert_eq!(forward, backward);
        assert_eq!(
            forward.iter().collect::<Vec<_>>(),
            backward.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_iteration_is_lexicographic() {
        let hosts: HostSet = ["10.0.0.10", "10.0.0.9", "10.0.0.1"].into_iter().collect();
        assert_eq!(
            hosts.iter().collect::<Vec<_>>(),
            vec!["10.0.0.1", "10.0.0.10", "10.0.0.9"]
        );
    }

    #[test]
    fn test_from_iter_drops_empty() {
        let hosts: HostSet = ["", " ", "10.0.0.1"].into_iter().collect();
        assert_eq!(hosts.to_vec(), vec!["10.0.0.1"]);
    }

    #[test]
    fn test_display() {
        let hosts: HostSet = ["10.0.0.2", "10.0.0.1"].into_iter().collect();
        assert_eq!(hosts.to_string(), "10.0.0.1,10.0.0.2");
        assert_eq!(HostSet::default().to_string(), "");
    }

    #[test]
    fn test_has_changed() {
        let a: HostSet = ["10.0.0.1", "10.0.0.2"].into_iter().collect();
        let same: HostSet = ["10.0.0.2", "10.0.0.1"].into_iter().collect();
        let b: HostSet = ["10.0.0.1"].into_iter().collect();

        assert!(has_changed(&a, None));
        assert!(!has_changed(&a, Some(&same)));
        assert!(has_changed(&a, Some(&b)));
        assert!(has_changed(&b, Some(&a)));
    }
}
