use std::sync::RwLock;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Default)]
struct SymbolTable {
    strings: Vec<&'static str>,
    indices: HashMap<&'static str, u32>,
}

static SYMBOL_TABLE: Lazy<RwLock<SymbolTable>> = Lazy::new(Default::default);

/// An index into the global symbol interning table. The table only ever
/// grows, so a symbol stays valid for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    pub fn new(value: &str) -> Self {
        {
            let table = SYMBOL_TABLE.read().unwrap();

            if let Some(index) = table.indices.get(value) {
                return Self(*index);
            }
        }

        let mut table = SYMBOL_TABLE.write().unwrap();

        // A racing writer may have inserted it between the read and write locks
        if let Some(index) = table.indices.get(value) {
            return Self(*index);
        }

        let leaked: &'static str = Box::leak(value.to_owned().into_boxed_str());
        let index = table.strings.len() as u32;
        table.strings.push(leaked);
        table.indices.insert(leaked, index);

        Self(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn value(&self) -> &'static str {
        SYMBOL_TABLE.read().unwrap().strings[self.0 as usize]
    }
}

impl core::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Symbol")
            .field(&self.0)
            .field(&self.value())
            .finish()
    }
}

impl core::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}
