#![allow(dead_code)]

use std::rc::Rc;

use sql_bridge::prelude::*;
use sql_bridge::NativeEngine;
use tempfile::TempDir;

/// An engine instance backed by a throwaway directory.
pub struct TestEngine {
    pub dir: TempDir,
    pub native: Rc<NativeEngine>,
    pub module: Rc<Module>,
}

impl TestEngine {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_max_memory(None)
    }

    pub fn with_max_memory(max_memory: Option<usize>) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut options = EngineOptions::new(dir.path());
        if let Some(max_memory) = max_memory {
            options.max_memory = max_memory;
        }
        let native = NativeEngine::new(&options)?;
        let module = Module::new(native.clone());
        Ok(Self {
            dir,
            native,
            module,
        })
    }

    pub fn open(&self) -> Result<Database, SqlBridgeError> {
        Database::open(&self.module, None)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }
}
