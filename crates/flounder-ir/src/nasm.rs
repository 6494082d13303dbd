//! External-assembler path: write the translated assembly text to a temp
//! file, run `nasm` on it, and read back the flat binary.

use std::io::Write as _;
use std::process::Command;

use flounder_error::{FlounderError, Result};

/// Assemble `code` with nasm and return the raw machine code bytes.
pub fn assemble_with_nasm(code: &str) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let asm_path = dir.path().join("query.asm");
    let obj_path = dir.path().join("query.bin");
    let mut asm_file = std::fs::File::create(&asm_path)?;
    asm_file.write_all(code.as_bytes())?;
    drop(asm_file);

    let output = Command::new("nasm")
        .arg("-o")
        .arg(&obj_path)
        .arg(&asm_path)
        .output()
        .map_err(|e| FlounderError::Assembler(format!("failed to run nasm: {e}")))?;
    if !output.status.success() {
        return Err(FlounderError::Assembler(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(std::fs::read(&obj_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nasm_available() -> bool {
        Command::new("nasm")
            .arg("-v")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn assembles_a_trivial_function() {
        if !nasm_available() {
            eprintln!("nasm not installed, skipping");
            return;
        }
        let code = assemble_with_nasm("bits 64\nret\n").unwrap();
        assert_eq!(code, vec![0xC3]);
    }

    #[test]
    fn reports_assembler_errors() {
        if !nasm_available() {
            return;
        }
        assert!(assemble_with_nasm("bits 64\nbogus_mnemonic rax\n").is_err());
    }
}
