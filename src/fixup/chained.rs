//! §4.4.2 Chained fixups.

use super::rebase::ImageMemory;
use crate::error::FixupError;

/// Which on-disk chained-pointer layout a segment uses. Corresponds to
/// the `DYLD_CHAINED_PTR_*` format codes in the `dyld_chained_starts_in_segment`
/// record; only the two layouts needed for plain and pointer-authenticated
/// arm64e binaries are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerFormat {
    /// `DYLD_CHAINED_PTR_64`: plain 64-bit rebase/bind, no authentication.
    Generic64,
    /// `DYLD_CHAINED_PTR_ARM64E`: authenticated rebase/bind with a
    /// per-location `{key, discriminator, uses-address-diversity}` triple.
    Arm64e,
}

/// One resolved import slot a bind chain link points into (§4.4.3's
/// `(library-ordinal, symbol-name, addend)` triple, pre-resolved by the
/// caller from the `DYLD_CHAINED_FIXUPS` imports table).
#[derive(Debug, Clone)]
pub struct ChainedImport {
    pub library_ordinal: i32,
    pub symbol_name: String,
    pub addend: i64,
    pub is_weak: bool,
}

/// Resolves a bind-chain link's import index to an address, the same
/// contract as the classic bind engine's symbol lookup (§4.4.3).
pub trait ImportResolver {
    fn resolve(&self, import: &ChainedImport) -> Result<Option<u64>, FixupError>;
}

/// Walks one chain starting at `start_vmaddr`, decoding each link and
/// rewriting it in place (§4.4.2). Returns the number of links walked.
pub fn walk_chain(
    mem: &mut dyn ImageMemory,
    imports: &[ChainedImport],
    resolver: &dyn ImportResolver,
    format: PointerFormat,
    start_vmaddr: u64,
    slide: i64,
) -> Result<usize, FixupError> {
    let mut vmaddr = start_vmaddr;
    let mut count = 0usize;
    loop {
        let raw = mem.read_u64(vmaddr)?;
        let (is_bind, next_stride) = match format {
            PointerFormat::Generic64 => decode_generic(mem, vmaddr, raw, imports, resolver, slide)?,
            PointerFormat::Arm64e => decode_arm64e(mem, vmaddr, raw, imports, resolver, slide)?,
        };
        count += 1;
        let _ = is_bind;
        if next_stride == 0 {
            break;
        }
        vmaddr = vmaddr.wrapping_add(next_stride as u64 * 4);
    }
    Ok(count)
}

fn decode_generic(
    mem: &mut dyn ImageMemory,
    vmaddr: u64,
    raw: u64,
    imports: &[ChainedImport],
    resolver: &dyn ImportResolver,
    slide: i64,
) -> Result<(bool, u32), FixupError> {
    let bind = (raw >> 63) & 1 != 0;
    let next = ((raw >> 51) & 0xFFF) as u32;
    if bind {
        let ordinal = (raw & 0x00FF_FFFF) as usize;
        let addend = ((raw >> 24) & 0xFF) as i64;
        let import = imports
            .get(ordinal)
            .ok_or(FixupError::BadChainedPointer { offset: vmaddr })?;
        let resolved = resolver.resolve(import)?;
        let value = match resolved {
            Some(addr) => (addr as i64 + addend) as u64,
            None if import.is_weak => 0,
            None => return Err(FixupError::BadChainedPointer { offset: vmaddr }),
        };
        mem.write_u64(vmaddr, value)?;
    } else {
        let target = raw & 0x0F_FFFF_FFFF; // 36 bits
        let high8 = (raw >> 36) & 0xFF;
        let unpacked = target | (high8 << 56);
        let rebased = (unpacked as i64 + slide) as u64;
        mem.write_u64(vmaddr, rebased)?;
    }
    Ok((bind, next))
}

fn decode_arm64e(
    mem: &mut dyn ImageMemory,
    vmaddr: u64,
    raw: u64,
    imports: &[ChainedImport],
    resolver: &dyn ImportResolver,
    slide: i64,
) -> Result<(bool, u32), FixupError> {
    let auth = (raw >> 63) & 1 != 0;
    let bind = (raw >> 62) & 1 != 0;
    let next = ((raw >> 51) & 0x7FF) as u32;

    if bind {
        let ordinal = (raw & 0xFFFF) as usize;
        let import = imports
            .get(ordinal)
            .ok_or(FixupError::BadChainedPointer { offset: vmaddr })?;
        let resolved = resolver.resolve(import)?;
        let mut value = match resolved {
            Some(addr) => {
                if auth {
                    addr
                } else {
                    let addend = ((raw >> 32) & 0x7_FFFF) as i64;
                    (addr as i64 + addend) as u64
                }
            }
            None if import.is_weak => 0,
            None => return Err(FixupError::BadChainedPointer { offset: vmaddr }),
        };
        if auth && value != 0 {
            let diversity = ((raw >> 32) & 0xFFFF) as u16;
            let addr_div = (raw >> 48) & 1 != 0;
            let key = ((raw >> 49) & 0x3) as u8;
            value = sign_pointer(value, vmaddr, diversity, addr_div, key);
        }
        mem.write_u64(vmaddr, value)?;
    } else {
        let (target, signed) = if auth {
            let runtime_offset = raw & 0xFFFF_FFFF; // 32 bits
            (runtime_offset, true)
        } else {
            (raw & 0x7FF_FFFF_FFFF, false) // 43 bits
        };
        let mut rebased = (target as i64 + slide) as u64;
        if signed {
            let diversity = ((raw >> 32) & 0xFFFF) as u16;
            let addr_div = (raw >> 48) & 1 != 0;
            let key = ((raw >> 49) & 0x3) as u8;
            rebased = sign_pointer(rebased, vmaddr, diversity, addr_div, key);
        }
        mem.write_u64(vmaddr, rebased)?;
    }
    Ok((bind, next))
}

/// Models signing a pointer with a per-location discriminator (§9
/// "Pointer authentication"). There is no real PAC instruction available
/// off-device; this crate's job is only to thread the `{key,
/// discriminator, uses-address-diversity}` triple through correctly, so
/// the "signature" is a deterministic mix rather than a cryptographic
/// one. A real target would replace this with the `pacda`/`pacia`
/// family of instructions.
fn sign_pointer(value: u64, vmaddr: u64, diversity: u16, addr_div: bool, key: u8) -> u64 {
    let mut discriminator = diversity as u64;
    if addr_div {
        discriminator ^= vmaddr;
    }
    let tag = (discriminator.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (key as u64).wrapping_shl(60)) >> 48;
    (value & 0x0000_FFFF_FFFF_FFFF) | ((tag & 0xFFFF) << 48)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecMemory(Vec<u8>);
    impl ImageMemory for VecMemory {
        fn read_u64(&self, vmaddr: u64) -> Result<u64, FixupError> {
            let i = vmaddr as usize;
            Ok(u64::from_le_bytes(self.0[i..i + 8].try_into().unwrap()))
        }
        fn write_u64(&mut self, vmaddr: u64, value: u64) -> Result<(), FixupError> {
            let i = vmaddr as usize;
            self.0[i..i + 8].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    }

    struct FixedResolver(u64);
    impl ImportResolver for FixedResolver {
        fn resolve(&self, _import: &ChainedImport) -> Result<Option<u64>, FixupError> {
            Ok(Some(self.0))
        }
    }

    #[test]
    fn generic_rebase_chain_applies_slide_and_stops() {
        let mut mem = VecMemory(vec![0u8; 0x100]);
        // target=0x2000, high8=0, bind=0, next=0 (single-link chain)
        mem.write_u64(0, 0x2000).unwrap();
        let n = walk_chain(&mut mem, &[], &FixedResolver(0), PointerFormat::Generic64, 0, 0x1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(mem.read_u64(0).unwrap(), 0x3000);
    }

    #[test]
    fn generic_bind_chain_resolves_import() {
        let mut mem = VecMemory(vec![0u8; 0x100]);
        // bind=1 (bit 63), ordinal=0, addend=0, next=0
        mem.write_u64(0, 1u64 << 63).unwrap();
        let imports = vec![ChainedImport {
            library_ordinal: 1,
            symbol_name: "_foo".into(),
            addend: 0,
            is_weak: false,
        }];
        let n = walk_chain(&mut mem, &imports, &FixedResolver(0x9999), PointerFormat::Generic64, 0, 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(mem.read_u64(0).unwrap(), 0x9999);
    }

    #[test]
    fn chain_walks_multiple_links_via_stride() {
        let mut mem = VecMemory(vec![0u8; 0x100]);
        // first link: rebase target=0x10, next=2 (stride 2*4=8 bytes)
        mem.write_u64(0, 0x10 | (2u64 << 51)).unwrap();
        // second link: rebase target=0x20, next=0
        mem.write_u64(8, 0x20).unwrap();
        let n = walk_chain(&mut mem, &[], &FixedResolver(0), PointerFormat::Generic64, 0, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(mem.read_u64(0).unwrap(), 0x10);
        assert_eq!(mem.read_u64(8).unwrap(), 0x20);
    }
}
