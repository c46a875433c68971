use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::MachineConfig;
use crate::console::Console;
use crate::fs::FileSystem;
use crate::guest::{GuestFactory, GuestProgram, ProgramRegistry};
use crate::memory::PhysMemory;
use crate::timer::Timer;

/// The simulated machine: physical memory, devices, the program registry,
/// and the halt latch. Created once and shared as a capability by everything
/// that needs hardware access.
pub struct Machine {
    config: MachineConfig,
    memory: Arc<PhysMemory>,
    file_system: Box<dyn FileSystem>,
    console: Console,
    timer: Timer,
    programs: ProgramRegistry,
    halted: Mutex<bool>,
    halt_signal: Condvar,
}

impl Machine {
    pub fn new(
        config: MachineConfig,
        file_system: Box<dyn FileSystem>,
        console: Console,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory: Arc::new(PhysMemory::new(config.num_phys_pages)),
            config,
            file_system,
            console,
            timer: Timer::new(),
            programs: ProgramRegistry::new(),
            halted: Mutex::new(false),
            halt_signal: Condvar::new(),
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<PhysMemory> {
        &self.memory
    }

    pub fn file_system(&self) -> &dyn FileSystem {
        self.file_system.as_ref()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    /// Registers a guest body for a program name; `exec` of that name will
    /// run a fresh instance.
    pub fn register_program<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn GuestProgram> + Send + Sync + 'static,
    {
        self.programs.register(name, Box::new(factory) as GuestFactory);
    }

    /// Stops the machine. User threads observe the latch and wind down; the
    /// call itself returns immediately.
    pub fn halt(&self) {
        log::debug!("machine halting");
        let mut halted = self.halted.lock().unwrap();
        *halted = true;
        self.halt_signal.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.lock().unwrap()
    }

    /// Blocks until the machine halts.
    pub fn wait_for_halt(&self) {
        let mut halted = self.halted.lock().unwrap();
        while !*halted {
            halted = self.halt_signal.wait(halted).unwrap();
        }
    }

    /// Blocks until the machine halts or the timeout passes; true if halted.
    pub fn wait_for_halt_timeout(&self, timeout: Duration) -> bool {
        let mut halted = self.halted.lock().unwrap();
        while !*halted {
            let (guard, result) = self
                .halt_signal
                .wait_timeout(halted, timeout)
                .unwrap();
            halted = guard;
            if result.timed_out() {
                return *halted;
            }
        }
        true
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("config", &self.config)
            .field("halted", &self.is_halted())
            .finish()
    }
}
