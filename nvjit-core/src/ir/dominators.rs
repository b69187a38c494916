//! Post-dominator sets over the method CFG.
//!
//! Computed with the classic iterative data-flow formulation against a virtual
//! exit that every returning block reaches. Methods here are small (one method
//! at a time), so plain sets are good enough.

use std::collections::{HashMap, HashSet};

use super::{BlockId, Method};

#[derive(Debug, Clone)]
pub struct PostDominators {
    sets: HashMap<BlockId, HashSet<BlockId>>,
}

impl PostDominators {
    pub fn compute(method: &Method) -> Self {
        let all: HashSet<BlockId> = method.layout.iter().copied().collect();
        let succs: HashMap<BlockId, Vec<BlockId>> = method
            .layout
            .iter()
            .map(|&b| {
                let s = method.successors(b).into_iter().filter(|s| all.contains(s)).collect();
                (b, s)
            })
            .collect();

        let mut sets: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
        for &b in &method.layout {
            if succs[&b].is_empty() {
                sets.insert(b, HashSet::from([b]));
            } else {
                sets.insert(b, all.clone());
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &b in method.layout.iter().rev() {
                let s = &succs[&b];
                if s.is_empty() {
                    continue;
                }
                let mut new: HashSet<BlockId> = sets[&s[0]].clone();
                for succ in &s[1..] {
                    new.retain(|x| sets[succ].contains(x));
                }
                new.insert(b);
                if new != sets[&b] {
                    sets.insert(b, new);
                    changed = true;
                }
            }
        }

        PostDominators { sets }
    }

    /// Every path from `b` to the method exit passes through `a`.
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.sets.get(&b).is_some_and(|s| s.contains(&a))
    }
}
