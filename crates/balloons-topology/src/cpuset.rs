//! CPU sets in the kernel list format.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An ordered set of CPU ids.
///
/// The textual form is the kernel cpulist format (`"0-3,40-43"`), which is
/// what sysfs produces, what the runtime expects in `linux.resources.cpu.cpus`
/// and what appears in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding the given ids.
    pub fn from_ids<I: IntoIterator<Item = usize>>(ids: I) -> Self {
        Self {
            cpus: ids.into_iter().collect(),
        }
    }

    /// Creates the contiguous set `[first, last]`.
    pub fn range(first: usize, last: usize) -> Self {
        Self::from_ids(first..=last)
    }

    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn insert(&mut self, cpu: usize) {
        self.cpus.insert(cpu);
    }

    pub fn remove(&mut self, cpu: usize) {
        self.cpus.remove(&cpu);
    }

    /// Smallest id in the set.
    pub fn first(&self) -> Option<usize> {
        self.cpus.iter().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.cpus.iter().copied().collect()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        Self {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        Self {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.cpus.is_disjoint(&other.cpus)
    }

    pub fn add(&mut self, other: &CpuSet) {
        self.cpus.extend(other.cpus.iter().copied());
    }

    pub fn subtract(&mut self, other: &CpuSet) {
        for cpu in other.iter() {
            self.cpus.remove(&cpu);
        }
    }

    /// Ids as a space-separated list (`"0 1 40 41"`), the form exported to
    /// container environment files.
    pub fn to_id_list(&self) -> String {
        let ids: Vec<String> = self.cpus.iter().map(|c| c.to_string()).collect();
        ids.join(" ")
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl Display for CpuSet {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for cpu in self.cpus.iter().copied() {
            match ranges.last_mut() {
                Some((_, last)) if *last + 1 == cpu => *last = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }
        let parts: Vec<String> = ranges
            .iter()
            .map(|(a, b)| {
                if a == b {
                    a.to_string()
                } else {
                    format!("{}-{}", a, b)
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for CpuSet {
    type Err = String;

    /// Parses the kernel cpulist format. Empty input (or a lone newline, as
    /// sysfs files end with one) is the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpus = BTreeSet::new();
        for part in s.trim().split(',') {
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((a, b)) => {
                    let first: usize = a.trim().parse().map_err(|_| format!("bad cpu id {:?}", a))?;
                    let last: usize = b.trim().parse().map_err(|_| format!("bad cpu id {:?}", b))?;
                    if last < first {
                        return Err(format!("bad cpu range {:?}", part));
                    }
                    cpus.extend(first..=last);
                }
                None => {
                    let id: usize = part
                        .trim()
                        .parse()
                        .map_err(|_| format!("bad cpu id {:?}", part))?;
                    cpus.insert(id);
                }
            }
        }
        Ok(Self { cpus })
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
