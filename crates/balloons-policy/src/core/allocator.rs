//! Topology-aware CPU allocation.
//!
//! `allocate` picks CPUs from a source set while keeping the topology as
//! unfragmented as possible: whole idle packages first, then whole idle
//! clusters, whole idle cores, and single threads last. Every stage ranks
//! its candidates with stable tie-breaks, so allocation is a pure function
//! of the source set, the demand, the preference and the topology.

use std::cmp::{Ordering, Reverse};
use std::rc::Rc;

use balloons_topology::cpuset::CpuSet;
use balloons_topology::system::{CoreKind, CpuPriority, System};

use crate::core::error::{Error, Result};

pub struct CpuAllocator {
    system: Rc<System>,
}

/// Per-call context: the CPU sets backing the priority comparisons.
struct AllocCtx {
    prefer: Option<CpuPriority>,
    prefer_cpus: CpuSet,
    higher_cpus: CpuSet,
}

impl CpuAllocator {
    pub fn new(system: Rc<System>) -> Self {
        Self { system }
    }

    /// Returns a subset of `from` of exactly `count` CPUs.
    ///
    /// Fails with `InsufficientCpus` when fewer than `count` online CPUs are
    /// available in `from`.
    pub fn allocate(&self, from: &CpuSet, count: usize, prefer: Option<CpuPriority>) -> Result<CpuSet> {
        let mut pool = from.intersection(&self.system.online_cpus());
        if pool.size() < count {
            return Err(Error::InsufficientCpus {
                requested: count,
                available: pool.size(),
            });
        }
        let ctx = self.make_ctx(prefer);
        let mut result = CpuSet::new();
        let mut remain = count;

        self.take_idle_packages(&mut pool, &mut result, &mut remain, &ctx);
        if remain > 0 {
            self.take_idle_clusters(&mut pool, &mut result, &mut remain, &ctx);
        }
        if remain > 0 {
            self.take_idle_cores(&mut pool, &mut result, &mut remain, &ctx);
        }
        if remain > 0 {
            self.take_idle_threads(&mut pool, &mut result, &mut remain, &ctx);
        }
        Ok(result)
    }

    /// Shrinks `from` to `keep` CPUs; returns `(kept, released)`.
    ///
    /// The kept subset is chosen by the same rules as `allocate`, so a
    /// shrunk balloon keeps its topologically tightest CPUs.
    pub fn release(
        &self,
        from: &CpuSet,
        keep: usize,
        prefer: Option<CpuPriority>,
    ) -> Result<(CpuSet, CpuSet)> {
        let kept = self.allocate(from, keep, prefer)?;
        Ok((kept.clone(), from.difference(&kept)))
    }

    fn make_ctx(&self, prefer: Option<CpuPriority>) -> AllocCtx {
        let prefer_cpus = prefer.map(|p| self.system.prio_cpus(p)).unwrap_or_default();
        let higher_cpus = match prefer {
            Some(p) => {
                let mut set = CpuSet::new();
                for other in [CpuPriority::High, CpuPriority::Normal, CpuPriority::Low] {
                    if other.rank() > p.rank() {
                        set.add(&self.system.prio_cpus(other));
                    }
                }
                set
            }
            None => CpuSet::new(),
        };
        AllocCtx {
            prefer,
            prefer_cpus,
            higher_cpus,
        }
    }

    /// Total order over candidate CPU sets for a demand of `cnt` CPUs:
    /// tighter fit of preferred-priority CPUs first, then fewer CPUs of
    /// higher-than-requested priority, then more CPUs at the requested
    /// priority.
    fn cmp_prio_sets(&self, a: &CpuSet, b: &CpuSet, ctx: &AllocCtx, cnt: usize) -> Ordering {
        let Some(p) = ctx.prefer else { return Ordering::Equal };
        let pa = a.intersection(&ctx.prefer_cpus).size();
        let pb = b.intersection(&ctx.prefer_cpus).size();
        if matches!(p, CpuPriority::Low | CpuPriority::High) {
            match (pa >= cnt, pb >= cnt) {
                (true, true) => {
                    if pa != pb {
                        return pa.cmp(&pb);
                    }
                }
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                (false, false) => {}
            }
            let ha = a.intersection(&ctx.higher_cpus).size();
            let hb = b.intersection(&ctx.higher_cpus).size();
            if ha != hb {
                return ha.cmp(&hb);
            }
        }
        pb.cmp(&pa)
    }

    /// Stage 1: whole packages whose online CPUs are all free.
    fn take_idle_packages(&self, pool: &mut CpuSet, result: &mut CpuSet, remain: &mut usize, ctx: &AllocCtx) {
        let online = self.system.online_cpus();
        let mut candidates: Vec<(usize, CpuSet)> = Vec::new();
        for package in self.system.package_ids() {
            let cpus = self.system.package_cpus(package).intersection(&online);
            if !cpus.is_empty() && cpus.is_subset(pool) {
                candidates.push((package, cpus));
            }
        }
        let demand = *remain;
        candidates.sort_by(|(ida, a), (idb, b)| {
            self.cmp_prio_sets(a, b, ctx, demand).then(ida.cmp(idb))
        });
        for (_, cpus) in candidates {
            if *remain == 0 {
                break;
            }
            if cpus.size() <= *remain {
                result.add(&cpus);
                pool.subtract(&cpus);
                *remain -= cpus.size();
            }
        }
    }

    /// Stage 2: whole idle clusters, tightest fitting unit first.
    ///
    /// A cluster qualifies when all its online CPUs are free and, on hybrid
    /// systems, its core kind matches the request. A single cluster that
    /// satisfies the whole remaining demand wins; otherwise the smallest die
    /// (then package) whose idle clusters can satisfy it is drained in id
    /// order. A tightest-fit cluster larger than the demand means the stage
    /// takes nothing.
    fn take_idle_clusters(&self, pool: &mut CpuSet, result: &mut CpuSet, remain: &mut usize, ctx: &AllocCtx) {
        let online = self.system.online_cpus();
        loop {
            if *remain == 0 {
                return;
            }
            let mut candidates: Vec<((usize, usize, usize), CpuSet)> = Vec::new();
            for key in self.system.cluster_ids() {
                let cpus = self.system.cluster_cpus(key).intersection(&online);
                if cpus.is_empty() || !cpus.is_subset(pool) {
                    continue;
                }
                if !self.cluster_kind_matches(&cpus, ctx.prefer) {
                    continue;
                }
                candidates.push((key, cpus));
            }
            if candidates.is_empty() {
                return;
            }

            let demand = *remain;
            let mut satisfying: Vec<&((usize, usize, usize), CpuSet)> = candidates
                .iter()
                .filter(|(_, cpus)| cpus.size() >= demand)
                .collect();
            if !satisfying.is_empty() {
                // tightest single cluster first
                satisfying.sort_by(|(ka, a), (kb, b)| {
                    a.size()
                        .cmp(&b.size())
                        .then(self.cmp_prio_sets(a, b, ctx, demand))
                        .then(ka.cmp(kb))
                });
                let (_, cpus) = satisfying[0];
                if cpus.size() > demand {
                    return;
                }
                result.add(cpus);
                pool.subtract(cpus);
                *remain -= cpus.size();
                continue;
            }

            // No single cluster is big enough; pick the tightest unit whose
            // idle clusters together can cover the demand.
            let unit = self.pick_cluster_unit(&candidates, demand);
            let mut took = false;
            for (key, cpus) in &candidates {
                if !unit_contains(&unit, *key) {
                    continue;
                }
                if cpus.size() <= *remain && cpus.is_subset(pool) {
                    result.add(cpus);
                    pool.subtract(cpus);
                    *remain -= cpus.size();
                    took = true;
                }
            }
            if !took {
                return;
            }
        }
    }

    /// Picks the die, else the package, else the whole system, whose idle
    /// clusters sum up to the demand.
    fn pick_cluster_unit(
        &self,
        candidates: &[((usize, usize, usize), CpuSet)],
        demand: usize,
    ) -> ClusterUnit {
        let mut die_sum: std::collections::BTreeMap<(usize, usize), usize> = Default::default();
        let mut pkg_sum: std::collections::BTreeMap<usize, usize> = Default::default();
        for ((package, die, _), cpus) in candidates {
            *die_sum.entry((*package, *die)).or_default() += cpus.size();
            *pkg_sum.entry(*package).or_default() += cpus.size();
        }
        for (key, sum) in &die_sum {
            if *sum >= demand {
                return ClusterUnit::Die(key.0, key.1);
            }
        }
        for (package, sum) in &pkg_sum {
            if *sum >= demand {
                return ClusterUnit::Package(*package);
            }
        }
        ClusterUnit::System
    }

    fn cluster_kind_matches(&self, cpus: &CpuSet, prefer: Option<CpuPriority>) -> bool {
        if !self.system.is_hybrid() {
            return true;
        }
        let kind = match cpus.first() {
            Some(cpu) => self.system.cpu(cpu).kind,
            None => return false,
        };
        match prefer {
            Some(CpuPriority::Low) => kind == CoreKind::Efficient,
            _ => kind == CoreKind::Performance,
        }
    }

    /// Stage 3: whole idle physical cores.
    fn take_idle_cores(&self, pool: &mut CpuSet, result: &mut CpuSet, remain: &mut usize, ctx: &AllocCtx) {
        let online = self.system.online_cpus();
        let mut cores: Vec<CpuSet> = Vec::new();
        for core in self.system.cores() {
            let cpus = core.intersection(&online);
            if !cpus.is_empty() && cpus.is_subset(pool) {
                cores.push(cpus);
            }
        }
        let demand = *remain;
        cores.sort_by(|a, b| {
            self.cmp_prio_sets(a, b, ctx, demand)
                .then(a.first().cmp(&b.first()))
        });
        for cpus in cores {
            if *remain == 0 {
                break;
            }
            if cpus.size() <= *remain {
                result.add(&cpus);
                pool.subtract(&cpus);
                *remain -= cpus.size();
            }
        }
    }

    /// Stage 4: single threads by the stable multi-key order.
    fn take_idle_threads(&self, pool: &mut CpuSet, result: &mut CpuSet, remain: &mut usize, ctx: &AllocCtx) {
        while *remain > 0 {
            let Some(best) = pool.iter().min_by_key(|cpu| self.thread_key(*cpu, pool, result, ctx)) else {
                return;
            };
            result.insert(best);
            pool.remove(best);
            *remain -= 1;
        }
    }

    #[allow(clippy::type_complexity)]
    fn thread_key(
        &self,
        cpu: usize,
        pool: &CpuSet,
        result: &CpuSet,
        ctx: &AllocCtx,
    ) -> (Reverse<usize>, Reverse<usize>, usize, Reverse<u32>, usize, usize, usize) {
        let package = self.system.package_of(cpu);
        let pkg_cpus = self.system.package_cpus(package);
        let pkg_free = pool.intersection(&pkg_cpus);
        let matches_prefer = u32::from(ctx.prefer_cpus.contains(cpu));
        (
            // more CPUs already picked in this package
            Reverse(result.intersection(&pkg_cpus).size()),
            // more preferred-priority CPUs still free in this package
            Reverse(pkg_free.intersection(&ctx.prefer_cpus).size()),
            package,
            Reverse(matches_prefer),
            // fewer free CPUs left on the package
            pkg_free.size(),
            // fewer free threads left on the core
            pool.intersection(&self.system.core_siblings(cpu)).size(),
            cpu,
        )
    }
}

enum ClusterUnit {
    Die(usize, usize),
    Package(usize),
    System,
}

fn unit_contains(unit: &ClusterUnit, key: (usize, usize, usize)) -> bool {
    match unit {
        ClusterUnit::Die(package, die) => key.0 == *package && key.1 == *die,
        ClusterUnit::Package(package) => key.0 == *package,
        ClusterUnit::System => true,
    }
}
