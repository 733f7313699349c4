//! Randomized allocation sequences checked against the manager's invariants

use crate::{AllocOptions, KeepReg, RegisterManager};
use pretty_assertions::assert_eq;
use regman_codegen::{Gpr, RecordingHooks, Reg, RegMask, Target};
use regman_common::{StorageType, ValueId};

/// Small deterministic generator so failures reproduce
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: usize) -> usize {
        self.next() as usize % n
    }
}

struct Driver {
    m: RegisterManager<RecordingHooks>,
    live: Vec<ValueId>,
    next_value: u32,
}

impl Driver {
    fn new(target: Target) -> Self {
        let options = AllocOptions::default();
        let mut m = RegisterManager::new(target, options, RecordingHooks::new());
        m.begin_method("stress", options);
        Self {
            m,
            live: Vec::new(),
            next_value: 1,
        }
    }

    fn fresh(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        self.m.hooks_mut().define(value, StorageType::Int32);
        value
    }

    fn home(&self, value: ValueId) -> Option<Reg> {
        (0..self.m.target().universe_size())
            .map(|i| Reg::new(i as u8))
            .find(|&reg| self.m.is_value_in_reg(reg, value))
    }

    fn resident(&self) -> Vec<ValueId> {
        self.live
            .iter()
            .copied()
            .filter(|&v| !self.m.is_spilled(v))
            .collect()
    }

    fn spilled(&self) -> Vec<ValueId> {
        self.live
            .iter()
            .copied()
            .filter(|&v| self.m.is_spilled(v))
            .collect()
    }

    fn allocate(&mut self) {
        let value = self.fresh();
        let all = self.m.allocatable::<Gpr>();
        let reg = self.m.pick_reg(all, RegMask::empty());
        self.m.mark_used(value, reg, None);
        self.live.push(value);
    }

    fn alias(&mut self, rng: &mut Lcg) {
        let resident = self.resident();
        if resident.is_empty() {
            return self.allocate();
        }
        let reg = self.home(resident[rng.below(resident.len())]);
        let value = self.fresh();
        if let Some(reg) = reg {
            self.m.mark_used(value, reg, None);
            self.live.push(value);
        }
    }

    fn free(&mut self, rng: &mut Lcg) {
        if self.live.is_empty() {
            return;
        }
        let value = self.live.swap_remove(rng.below(self.live.len()));
        if self.m.is_spilled(value) {
            let temp = self.m.unspill_in_place(value);
            self.m.release_temp(temp);
        } else if let Some(reg) = self.home(value) {
            self.m.mark_value_free(reg, value);
        }
    }

    fn spill(&mut self, rng: &mut Lcg) {
        let resident = self.resident();
        if resident.is_empty() {
            return;
        }
        if let Some(reg) = self.home(resident[rng.below(resident.len())]) {
            self.m.spill_reg(reg);
        }
    }

    fn reload(&mut self, rng: &mut Lcg) {
        let spilled = self.spilled();
        if spilled.is_empty() {
            return;
        }
        let value = spilled[rng.below(spilled.len())];
        let keep = if rng.below(4) == 0 {
            KeepReg::Free
        } else {
            KeepReg::Keep
        };
        self.m.reload(value, RegMask::<Gpr>::empty(), keep);
        if keep == KeepReg::Free {
            self.live.retain(|&v| v != value);
        }
    }

    fn grab_while_locked(&mut self, rng: &mut Lcg) {
        let resident = self.resident();
        if resident.is_empty() {
            return;
        }
        let Some(locked) = self.home(resident[rng.below(resident.len())]) else {
            return;
        };
        self.m.lock_used_reg(locked.mask());
        let all = self.m.allocatable::<Gpr>();
        let reg = self.m.grab(all);
        assert!(reg != locked, "grab returned locked {}", reg);
        self.m.unlock_used_reg(locked.mask());

        let value = self.fresh();
        self.m.mark_used(value, reg, None);
        self.live.push(value);
    }

    fn check(&self, step: usize) {
        assert_eq!(self.m.check_invariants(), Vec::<String>::new(), "after step {}", step);
        assert!(self.m.regs().locked().is_empty(), "locks leaked at step {}", step);
        for &value in &self.live {
            let resident = self.home(value).is_some();
            assert!(
                resident != self.m.is_spilled(value),
                "{} is both or neither resident and spilled at step {}",
                value,
                step
            );
        }
    }

    fn drain(&mut self, rng: &mut Lcg) {
        while !self.live.is_empty() {
            self.free(rng);
        }
    }
}

fn run(target: Target, seed: u64, steps: usize) {
    let mut rng = Lcg(seed);
    let mut driver = Driver::new(target);

    for step in 0..steps {
        match rng.below(10) {
            0..=3 => driver.allocate(),
            4 => driver.alias(&mut rng),
            5 | 6 => driver.free(&mut rng),
            7 => driver.spill(&mut rng),
            8 => driver.reload(&mut rng),
            _ => driver.grab_while_locked(&mut rng),
        }
        driver.check(step);
    }

    driver.drain(&mut rng);
    let summary = driver.m.finish_method();
    assert!(summary.is_ok(), "seed {}: {:?}", seed, summary);
}

#[test]
fn test_stress_x86() {
    for seed in 1..=20 {
        run(Target::x86(), seed, 400);
    }
}

#[test]
fn test_stress_arm32() {
    for seed in 100..=110 {
        run(Target::arm32(), seed, 400);
    }
}
