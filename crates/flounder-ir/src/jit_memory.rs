//! Executable memory for compiled queries.

use flounder_error::{FlounderError, Result};

/// A code buffer mapped with execute protection. The mapping is released
/// when the value drops, after query execution.
#[derive(Debug)]
pub struct ExecutableCode {
    map: memmap2::Mmap,
    len: usize,
}

impl ExecutableCode {
    /// Copy `code` into a fresh anonymous mapping and flip it to
    /// read+execute.
    pub fn from_bytes(code: &[u8]) -> Result<Self> {
        if code.is_empty() {
            return Err(FlounderError::codegen("empty code buffer"));
        }
        let mut map = memmap2::MmapOptions::new()
            .len(code.len())
            .map_anon()
            .map_err(|e| FlounderError::Codegen(format!("mmap failed: {e}")))?;
        map[..code.len()].copy_from_slice(code);
        let map = map
            .make_exec()
            .map_err(|e| FlounderError::Codegen(format!("mprotect failed: {e}")))?;
        Ok(Self {
            map,
            len: code.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The compiled query as a parameterless function.
    ///
    /// # Safety
    ///
    /// The buffer must contain a complete, ABI-correct function for the
    /// current process.
    pub unsafe fn entry(&self) -> extern "C" fn() {
        std::mem::transmute::<*const u8, extern "C" fn()>(self.map.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_code_is_rejected() {
        assert!(ExecutableCode::from_bytes(&[]).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn executes_a_bare_ret() {
        let code = ExecutableCode::from_bytes(&[0xC3]).unwrap();
        let f = unsafe { code.entry() };
        f();
    }
}
