use std::collections::HashMap;
use std::sync::Mutex;

use crate::cpu::{Cpu, Trap};

/// The seam where the MIPS interpreter plugs in.
///
/// A guest runs user instructions against its thread's CPU context until
/// something needs the kernel, then hands back the trap cause. After the
/// kernel handles the trap the guest is resumed with the same context; a
/// guest that raised a fault and was not killed retries the access.
pub trait GuestProgram: Send {
    fn run(&mut self, cpu: &mut Cpu) -> Trap;
}

/// Adapts a closure into a [`GuestProgram`], the usual way test suites
/// script user programs.
pub struct FnGuest<F>(F);

impl<F> FnGuest<F>
where
    F: FnMut(&mut Cpu) -> Trap + Send + 'static,
{
    pub fn boxed(f: F) -> Box<dyn GuestProgram> {
        Box::new(Self(f))
    }
}

impl<F> GuestProgram for FnGuest<F>
where
    F: FnMut(&mut Cpu) -> Trap + Send,
{
    fn run(&mut self, cpu: &mut Cpu) -> Trap {
        (self.0)(cpu)
    }
}

pub type GuestFactory = Box<dyn Fn() -> Box<dyn GuestProgram> + Send + Sync>;

/// Maps executable names to guest bodies so `exec` can wire a freshly
/// loaded image to an interpreter instance.
#[derive(Default)]
pub struct ProgramRegistry {
    factories: Mutex<HashMap<String, GuestFactory>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: GuestFactory) {
        self.factories
            .lock()
            .unwrap()
            .insert(name.to_string(), factory);
    }

    /// A fresh guest instance for `name`, if one is registered.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn GuestProgram>> {
        self.factories.lock().unwrap().get(name).map(|f| f())
    }
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("registered", &self.factories.lock().unwrap().len())
            .finish()
    }
}
