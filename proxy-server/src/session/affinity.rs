// 会话线程绑核
//
// 从编号最大的核心开始向下分配，避开0号核心。

use core_affinity::CoreId;

#[derive(Debug, Clone)]
pub struct CoreAllocator {
    cores: Vec<CoreId>,
    next: usize,
}

impl CoreAllocator {
    /// 探测本机核心
    pub fn detect() -> Self {
        Self::from_cores(core_affinity::get_core_ids().unwrap_or_default())
    }

    pub fn from_cores(mut cores: Vec<CoreId>) -> Self {
        cores.sort_by(|a, b| b.id.cmp(&a.id));
        cores.dedup_by_key(|core| core.id);
        if cores.len() > 1 {
            cores.retain(|core| core.id != 0);
        }
        Self { cores, next: 0 }
    }

    /// 下一个核心；核心用完后循环复用
    pub fn next_core(&mut self) -> Option<CoreId> {
        if self.cores.is_empty() {
            return None;
        }
        let core = self.cores[self.next % self.cores.len()];
        self.next += 1;
        Some(core)
    }
}
