//! Executable images
//!
//! Parsing executables is the loader's business. The core only sees the
//! result, an [`ExecImage`]: an entry point plus the segments to map. This
//! module maps images into an address space, builds the initial user stack
//! and writes the argument and environment vectors.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{KernelConfig, PAGE_SIZE};
use crate::error::{KernResult, KernelError};
use crate::kern::credentials::Credentials;
use crate::vm::address_space::page_round_up;
use crate::vm::{AddressSpace, VmProt};

/// Lowest address the argument block is placed at
pub const ARGUMENT_BASE: usize = 0x0000_6000_0000_0000;

// ============================================================================
// Loader seam
// ============================================================================

/// One loadable segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    /// Size in memory; bytes past `data` are zero filled
    pub mem_size: usize,
    pub prot: VmProt,
    pub data: Vec<u8>,
}

/// A loaded executable, ready to be mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecImage {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

/// Resolves a path to an executable image
///
/// Implemented by the filesystem layer. Errors are returned unchanged to the
/// caller of `exec`.
pub trait ImageLoader: Sync {
    fn load(&self, credentials: &Credentials, path: &str) -> KernResult<ExecImage>;
}

impl Segment {
    /// Page-aligned `[start, end)` the segment occupies once mapped
    fn page_span(&self) -> KernResult<(usize, usize)> {
        if self.data.len() > self.mem_size {
            return Err(KernelError::ExecFormat);
        }
        let page_offset = self.vaddr & (PAGE_SIZE - 1);
        let start = self.vaddr - page_offset;
        let size = self
            .mem_size
            .checked_add(page_offset)
            .and_then(page_round_up)
            .ok_or(KernelError::ExecFormat)?;
        let end = start.checked_add(size).ok_or(KernelError::ExecFormat)?;
        Ok((start, end))
    }
}

impl ExecImage {
    /// Reject images that cannot be mapped next to the user stack
    ///
    /// Checks what `map_into` would otherwise only find out after the old
    /// image is gone: data larger than its segment, address overflow, and
    /// segments overlapping each other or the user stack.
    pub fn validate(&self, config: &KernelConfig) -> KernResult<()> {
        let stack_bottom = config
            .user_stack_top
            .checked_sub(config.user_stack_size)
            .ok_or(KernelError::InvalidArgument)?;

        let mut spans = Vec::new();
        spans.try_reserve_exact(self.segments.len() + 1)?;
        spans.push((stack_bottom, config.user_stack_top));
        for segment in &self.segments {
            if segment.mem_size == 0 {
                if !segment.data.is_empty() {
                    return Err(KernelError::ExecFormat);
                }
                continue;
            }
            let (start, end) = segment.page_span()?;
            if spans.iter().any(|&(s, e)| start < e && s < end) {
                return Err(KernelError::ExecFormat);
            }
            spans.push((start, end));
        }
        Ok(())
    }

    /// Map every segment into `space` and copy its contents
    pub fn map_into(&self, space: &mut AddressSpace) -> KernResult<()> {
        for segment in self.segments.iter().filter(|s| s.mem_size != 0) {
            let (start, end) = segment.page_span()?;
            space.map(start, end - start, segment.prot)?;
            space.write(segment.vaddr, &segment.data)?;
        }
        Ok(())
    }
}

// ============================================================================
// Initial user stack and arguments
// ============================================================================

/// Map the initial user stack; returns the initial stack pointer
pub fn map_user_stack(space: &mut AddressSpace, config: &KernelConfig) -> KernResult<usize> {
    let size = config.user_stack_size;
    let top = config.user_stack_top;
    let bottom = top.checked_sub(size).ok_or(KernelError::InvalidArgument)?;
    space.map(bottom, size, VmProt::DEFAULT)?;
    Ok(top)
}

/// Where the argument vectors ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentBlock {
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
}

/// Copy `argv` and `envp` into a fresh region of `space`
///
/// Layout: the NULL-terminated `argv` pointer array, the NULL-terminated
/// `envp` pointer array, then the NUL-terminated strings.
pub fn write_arguments(
    space: &mut AddressSpace,
    argv: &[String],
    envp: &[String],
) -> KernResult<ArgumentBlock> {
    const WORD: usize = core::mem::size_of::<usize>();

    let pointers = (argv.len() + 1 + envp.len() + 1) * WORD;
    let strings: usize = argv.iter().chain(envp).map(|s| s.len() + 1).sum();
    let size = pointers + strings;

    let base = space
        .find_free(ARGUMENT_BASE, size)
        .ok_or(KernelError::OutOfMemory)?;
    space.map(base, size, VmProt::DEFAULT)?;

    let argv_base = base;
    let envp_base = base + (argv.len() + 1) * WORD;
    let mut string_at = base + pointers;

    for (array, strings) in [(argv_base, argv), (envp_base, envp)] {
        for (index, string) in strings.iter().enumerate() {
            space.write(string_at, string.as_bytes())?;
            space.write(string_at + string.len(), &[0])?;
            space.write_usize(array + index * WORD, string_at)?;
            string_at += string.len() + 1;
        }
        space.write_usize(array + strings.len() * WORD, 0)?;
    }

    Ok(ArgumentBlock {
        argc: argv.len(),
        argv: argv_base,
        envp: envp_base,
    })
}

/// Owned copy of a string vector, failing cleanly on allocation failure
pub(crate) fn copy_strings(strings: &[&str]) -> KernResult<Vec<String>> {
    let mut out = Vec::new();
    out.try_reserve_exact(strings.len())?;
    for string in strings {
        let mut owned = String::new();
        owned.try_reserve_exact(string.len())?;
        owned.push_str(string);
        out.push(owned);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn read_string(space: &AddressSpace, mut addr: usize) -> String {
        let mut out = String::new();
        loop {
            let byte = space.read(addr, 1).unwrap()[0];
            if byte == 0 {
                return out;
            }
            out.push(byte as char);
            addr += 1;
        }
    }

    #[test]
    fn test_segments_are_mapped_and_copied() {
        let image = ExecImage {
            entry: 0x40_1000,
            segments: vec![
                Segment {
                    vaddr: 0x40_1010,
                    mem_size: 0x20,
                    prot: VmProt::READ.union(VmProt::EXECUTE),
                    data: vec![0xaa; 4],
                },
                Segment {
                    vaddr: 0x60_0000,
                    mem_size: 3 * PAGE_SIZE,
                    prot: VmProt::DEFAULT,
                    data: vec![],
                },
            ],
        };
        let mut space = AddressSpace::new();
        image.map_into(&mut space).unwrap();

        assert_eq!(space.region_count(), 2);
        assert_eq!(space.read(0x40_1010, 5).unwrap(), [0xaa, 0xaa, 0xaa, 0xaa, 0]);
        assert!(space.contains_range(0x60_0000, 3 * PAGE_SIZE));
    }

    #[test]
    fn test_oversized_segment_data_rejected() {
        let image = ExecImage {
            entry: 0,
            segments: vec![Segment {
                vaddr: 0x1000,
                mem_size: 2,
                prot: VmProt::READ,
                data: vec![1, 2, 3],
            }],
        };
        let mut space = AddressSpace::new();
        assert_eq!(image.map_into(&mut space), Err(KernelError::ExecFormat));
    }

    fn segment(vaddr: usize, mem_size: usize, data: Vec<u8>) -> Segment {
        Segment {
            vaddr,
            mem_size,
            prot: VmProt::READ,
            data,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_image() {
        let config = KernelConfig::new();
        let image = ExecImage {
            entry: 0x40_1000,
            segments: vec![
                segment(0x40_1010, 0x20, vec![0xaa; 4]),
                segment(0x40_2000, PAGE_SIZE, vec![]),
                segment(0x90_0000, 0, vec![]),
            ],
        };
        assert_eq!(image.validate(&config), Ok(()));
    }

    #[test]
    fn test_validate_rejects_malformed_segments() {
        let config = KernelConfig::new();
        let check = |segments: Vec<Segment>| ExecImage { entry: 0, segments }.validate(&config);

        // Data larger than the segment
        assert_eq!(check(vec![segment(0x1000, 4, vec![0; 64])]), Err(KernelError::ExecFormat));
        assert_eq!(check(vec![segment(0x1000, 0, vec![1])]), Err(KernelError::ExecFormat));
        // Wraps around the address space
        assert_eq!(
            check(vec![segment(usize::MAX - 0x10, 0x100, vec![])]),
            Err(KernelError::ExecFormat)
        );
        // Two segments sharing a page
        assert_eq!(
            check(vec![segment(0x40_0000, 0x10, vec![]), segment(0x40_0800, 0x10, vec![])]),
            Err(KernelError::ExecFormat)
        );
        // Over the user stack
        let stack = config.user_stack_top - PAGE_SIZE;
        assert_eq!(check(vec![segment(stack, 0x10, vec![])]), Err(KernelError::ExecFormat));
    }

    #[test]
    fn test_argument_block_layout() {
        let mut space = AddressSpace::new();
        let argv = copy_strings(&["/bin/sh", "-c"]).unwrap();
        let envp = copy_strings(&["HOME=/"]).unwrap();
        let block = write_arguments(&mut space, &argv, &envp).unwrap();

        assert_eq!(block.argc, 2);
        assert_eq!(block.argv, ARGUMENT_BASE);
        let word = core::mem::size_of::<usize>();
        let arg0 = space.read_usize(block.argv).unwrap();
        let arg1 = space.read_usize(block.argv + word).unwrap();
        assert_eq!(read_string(&space, arg0), "/bin/sh");
        assert_eq!(read_string(&space, arg1), "-c");
        assert_eq!(space.read_usize(block.argv + 2 * word).unwrap(), 0);

        let env0 = space.read_usize(block.envp).unwrap();
        assert_eq!(read_string(&space, env0), "HOME=/");
        assert_eq!(space.read_usize(block.envp + word).unwrap(), 0);
    }

    #[test]
    fn test_user_stack() {
        let config = KernelConfig::new();
        let mut space = AddressSpace::new();
        let sp = map_user_stack(&mut space, &config).unwrap();
        assert_eq!(sp, config.user_stack_top);
        assert!(space.contains_range(sp - 16, 16));
        // A second stack would overlap the first
        assert!(map_user_stack(&mut space, &config).is_err());
    }
}
