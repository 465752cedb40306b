// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory domains and fpages.
//!
//! A memory domain is what the MPU enforces while a member thread runs: a
//! bounded set of statically configured partitions plus a table of fpage
//! mappings installed at runtime by map/grant items. Partition admission
//! violations are configuration errors and halt the kernel; mapping
//! failures are runtime errors reported to the caller.

use abi::{Fpage, Rights, Word};

use crate::config::{MAX_MAPPINGS, MAX_PARTITIONS};
use crate::fail;

bitflags::bitflags! {
    /// Fpage status bits, returned in place on unmap.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct MapStatus: u32 {
        const WAS_REFERENCED = 1 << 0;
        const WAS_WRITTEN = 1 << 1;
        const WAS_EXECUTED = 1 << 2;
    }
}

/// A statically configured span of accessible memory.
#[derive(Copy, Clone, Debug)]
pub struct Partition {
    pub base: usize,
    pub size: usize,
    pub rights: Rights,
}

impl kerncore::MemoryRegion for Partition {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.base + self.size
    }
}

/// An fpage installed by a map or grant item.
#[derive(Copy, Clone, Debug)]
pub struct Mapping {
    pub fpage: Fpage,
    pub status: MapStatus,
    /// Domain the mapping was derived from, for flush propagation.
    pub src_domain: Option<usize>,
    /// Whether ownership was transferred (grant) rather than shared (map).
    pub granted: bool,
}

/// Uniform region view used for coverage checks across both tables.
#[derive(Copy, Clone, Debug)]
struct Span {
    base: usize,
    end: usize,
    ok: bool,
}

impl kerncore::MemoryRegion for Span {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.end
    }
}

/// Why a partition cannot be admitted to a domain. All of these are fatal:
/// they indicate a bad static configuration, not a runtime condition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DomainConfigError {
    OutsideRam,
    OverlapsSibling,
    BadAlignment,
    OverlapsKernel,
    TableFull,
}

/// Why a mapping operation failed at runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapError {
    /// Source thread lacks the requested access to the fpage.
    NoAccess,
    /// No free mapping slot -- the "page-table space" exhaustion case.
    NoSpace,
    /// The destination range overlaps an existing mapping.
    Overlap,
    /// The named fpage is not mapped in the domain.
    NotMapped,
}

#[derive(Clone, Debug)]
pub struct MemDomain {
    partitions: [Option<Partition>; MAX_PARTITIONS],
    mappings: [Option<Mapping>; MAX_MAPPINGS],
    /// Bitmask of member thread indices.
    pub threads: u32,
    /// Whether this table slot is backed by a live kernel object.
    pub in_use: bool,
    /// Configured KIP area, if this space has one.
    pub kip_area: Option<(Word, Word)>,
    /// Configured UTCB area.
    pub utcb_area: Option<(Word, Word)>,
}

impl MemDomain {
    pub fn new() -> Self {
        Self {
            partitions: [None; MAX_PARTITIONS],
            mappings: [None; MAX_MAPPINGS],
            threads: 0,
            in_use: false,
            kip_area: None,
            utcb_area: None,
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> + '_ {
        self.partitions.iter().flatten()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.mappings.iter().flatten()
    }

    /// Admits a partition, enforcing the constraints the MPU and the kernel
    /// demand. Returns the violation rather than halting so startup can
    /// attribute it; use [`add_partition_or_die`] on the boot path.
    pub fn try_add_partition(
        &mut self,
        p: Partition,
        ram: (usize, usize),
        kernel_regions: &[(usize, usize)],
    ) -> Result<(), DomainConfigError> {
        // Alignment and size constraints: naturally aligned power-of-two,
        // the shape MPU region registers can express.
        if p.size == 0 || !p.size.is_power_of_two() || p.base % p.size != 0 {
            return Err(DomainConfigError::BadAlignment);
        }
        let (ram_base, ram_size) = ram;
        let p_end = p.base.checked_add(p.size)
            .ok_or(DomainConfigError::OutsideRam)?;
        if p.base < ram_base || p_end > ram_base + ram_size {
            return Err(DomainConfigError::OutsideRam);
        }
        for (kb, ks) in kernel_regions {
            if p.base < kb + ks && *kb < p_end {
                return Err(DomainConfigError::OverlapsKernel);
            }
        }
        for sib in self.partitions() {
            if p.base < sib.base + sib.size && sib.base < p_end {
                return Err(DomainConfigError::OverlapsSibling);
            }
        }
        let slot = self
            .partitions
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(DomainConfigError::TableFull)?;
        *slot = Some(p);
        Ok(())
    }

    /// Boot-path partition admission: violation is a fatal configuration
    /// error, not a runtime signal.
    pub fn add_partition_or_die(
        &mut self,
        p: Partition,
        ram: (usize, usize),
        kernel_regions: &[(usize, usize)],
    ) {
        if let Err(e) = self.try_add_partition(p, ram, kernel_regions) {
            fail::die(
                abi::HaltReason::Panic,
                &format_args!("bad partition {:#x}+{:#x}: {e:?}", p.base, p.size),
            );
        }
    }

    pub fn remove_partition(&mut self, base: usize) -> bool {
        for slot in self.partitions.iter_mut() {
            if matches!(slot, Some(p) if p.base == base) {
                *slot = None;
                return true;
            }
        }
        false
    }

    fn spans(&self, rights: Rights) -> ([Span; MAX_PARTITIONS + MAX_MAPPINGS], usize) {
        let mut spans = [Span { base: 0, end: 0, ok: false };
            MAX_PARTITIONS + MAX_MAPPINGS];
        let mut n = 0;
        for p in self.partitions() {
            spans[n] = Span {
                base: p.base,
                end: p.base + p.size,
                ok: p.rights.contains(rights),
            };
            n += 1;
        }
        for m in self.mappings() {
            spans[n] = Span {
                base: m.fpage.base,
                end: m.fpage.end(),
                ok: m.fpage.rights.contains(rights),
            };
            n += 1;
        }
        (spans, n)
    }

    /// Whether the domain confers `rights` over every byte of
    /// `base..base+len`. Partitions and installed mappings both count, and
    /// a span may cross from one into the other.
    pub fn can_access(&self, base: usize, len: usize, rights: Rights) -> bool {
        struct S {
            base: usize,
            len: usize,
        }
        impl kerncore::UserSlice for S {
            fn is_empty(&self) -> bool {
                self.len == 0
            }
            fn base_addr(&self) -> usize {
                self.base
            }
            fn end_addr(&self) -> usize {
                self.base + self.len
            }
        }
        let (spans, n) = self.spans(rights);
        kerncore::can_access(S { base, len }, &spans[..n], |s| s.ok)
    }

    /// Records an access to `base..base+len` in the status bits of every
    /// intersecting mapping.
    pub fn mark_access(&mut self, base: usize, len: usize, write: bool) {
        if len == 0 {
            return;
        }
        let end = base + len;
        for m in self.mappings.iter_mut().flatten() {
            if m.fpage.base < end && base < m.fpage.end() {
                m.status |= MapStatus::WAS_REFERENCED;
                if write {
                    m.status |= MapStatus::WAS_WRITTEN;
                }
            }
        }
    }

    /// Records an instruction fetch at `addr`. Called by the port's
    /// execution-tracing hook; the core itself cannot observe fetches.
    pub fn note_execution(&mut self, addr: usize) {
        for m in self.mappings.iter_mut().flatten() {
            if m.fpage.contains(addr) {
                m.status |= MapStatus::WAS_REFERENCED
                    | MapStatus::WAS_EXECUTED;
            }
        }
    }

    /// Installs a mapping. The destination range must not overlap an
    /// existing mapping.
    pub fn install_mapping(&mut self, m: Mapping) -> Result<(), MapError> {
        for existing in self.mappings() {
            if m.fpage.base < existing.fpage.end()
                && existing.fpage.base < m.fpage.end()
            {
                return Err(MapError::Overlap);
            }
        }
        let slot = self
            .mappings
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(MapError::NoSpace)?;
        *slot = Some(m);
        Ok(())
    }

    /// Removes the mapping anchored at `fpage.base`, returning its status
    /// bits and source domain.
    pub fn remove_mapping(
        &mut self,
        base: Word,
    ) -> Option<(MapStatus, Option<usize>)> {
        for slot in self.mappings.iter_mut() {
            if matches!(slot, Some(m) if m.fpage.base == base) {
                let m = slot.take().unwrap();
                return Some((m.status, m.src_domain));
            }
        }
        None
    }

    /// Looks up the mapping anchored at `base`.
    pub fn mapping_at(&self, base: Word) -> Option<&Mapping> {
        self.mappings.iter().flatten().find(|m| m.fpage.base == base)
    }
}

impl Default for MemDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs `fpage` from `src_dom` into `dst_dom` at `dest_base`, with the
/// source's access as the upper bound on rights. `grant` additionally
/// removes the source's own mapping, transferring ownership.
pub fn map_page(
    mdomains: &mut [MemDomain],
    src_dom: usize,
    dst_dom: usize,
    fpage: Fpage,
    dest_base: Word,
    grant: bool,
) -> Result<(), MapError> {
    let size = fpage.size() as usize;
    let src = &mdomains[src_dom];
    if !src.can_access(fpage.base, size, fpage.rights) {
        return Err(MapError::NoAccess);
    }
    if grant && src.mapping_at(fpage.base).is_none() {
        // Only mapped (not partition-backed) memory can be relinquished.
        return Err(MapError::NotMapped);
    }

    let mapping = Mapping {
        fpage: Fpage::new(dest_base, fpage.size_log2, fpage.rights),
        status: MapStatus::empty(),
        src_domain: Some(src_dom),
        granted: grant,
    };
    mdomains[dst_dom].install_mapping(mapping)?;

    if grant {
        mdomains[src_dom].remove_mapping(fpage.base);
    }
    Ok(())
}

/// Clears the mapping anchored at `fpage.base` in `dom`, returning its
/// status bits. With `flush`, mappings in every other domain that were
/// derived from `dom` and overlap the fpage are cleared too.
pub fn unmap_page(
    mdomains: &mut [MemDomain],
    dom: usize,
    fpage: Fpage,
    flush: bool,
) -> Result<MapStatus, MapError> {
    let (status, _src) = mdomains[dom]
        .remove_mapping(fpage.base)
        .ok_or(MapError::NotMapped)?;

    if flush {
        let end = fpage.end();
        for (i, d) in mdomains.iter_mut().enumerate() {
            if i == dom {
                continue;
            }
            for slot in d.mappings.iter_mut() {
                let derived = matches!(
                    slot,
                    Some(m) if m.src_domain == Some(dom)
                        && m.fpage.base < end
                        && fpage.base < m.fpage.end()
                );
                if derived {
                    *slot = None;
                }
            }
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM: (usize, usize) = (0x2000_0000, 0x10_0000);

    fn domain_with_partition() -> MemDomain {
        let mut d = MemDomain::new();
        d.add_partition_or_die(
            Partition {
                base: 0x2000_0000,
                size: 0x1_0000,
                rights: Rights::READ | Rights::WRITE,
            },
            RAM,
            &[],
        );
        d
    }

    #[test]
    fn partition_admission_checks() {
        let mut d = MemDomain::new();
        // Unaligned.
        assert_eq!(
            d.try_add_partition(
                Partition { base: 0x2000_0400, size: 0x1000, rights: Rights::READ },
                RAM,
                &[],
            ),
            Err(DomainConfigError::BadAlignment)
        );
        // Outside RAM.
        assert_eq!(
            d.try_add_partition(
                Partition { base: 0x1000_0000, size: 0x1000, rights: Rights::READ },
                RAM,
                &[],
            ),
            Err(DomainConfigError::OutsideRam)
        );
        // Kernel overlap.
        assert_eq!(
            d.try_add_partition(
                Partition { base: 0x2000_0000, size: 0x1000, rights: Rights::READ },
                RAM,
                &[(0x2000_0800, 0x800)],
            ),
            Err(DomainConfigError::OverlapsKernel)
        );
        // Good one.
        assert!(d
            .try_add_partition(
                Partition { base: 0x2000_0000, size: 0x1000, rights: Rights::READ },
                RAM,
                &[],
            )
            .is_ok());
        // Sibling overlap.
        assert_eq!(
            d.try_add_partition(
                Partition { base: 0x2000_0000, size: 0x2000, rights: Rights::READ },
                RAM,
                &[],
            ),
            Err(DomainConfigError::OverlapsSibling)
        );
    }

    #[test]
    fn access_spans_partition_and_mapping() {
        let mut d = domain_with_partition();
        d.install_mapping(Mapping {
            fpage: Fpage::new(0x2001_0000, 12, Rights::READ),
            status: MapStatus::empty(),
            src_domain: None,
            granted: false,
        })
        .unwrap();
        // Crosses from the partition into the mapping.
        assert!(d.can_access(0x2000_f000, 0x1800, Rights::READ));
        // Write is bounded by the mapping's rights.
        assert!(!d.can_access(0x2000_f000, 0x1800, Rights::WRITE));
        assert!(d.can_access(0x2000_f000, 0x1000, Rights::WRITE));
    }

    #[test]
    fn map_then_unmap_round_trips_domain_state() {
        let mut doms = [domain_with_partition(), MemDomain::new()];
        let fpage = Fpage::new(0x2000_4000, 12, Rights::READ | Rights::WRITE);
        map_page(&mut doms, 0, 1, fpage, 0x2000_4000, false).unwrap();
        assert!(doms[1].can_access(0x2000_4000, 0x1000, Rights::READ));

        doms[1].mark_access(0x2000_4000, 4, true);
        let status = unmap_page(&mut doms, 1, fpage, false).unwrap();
        assert!(status.contains(MapStatus::WAS_WRITTEN));
        assert!(status.contains(MapStatus::WAS_REFERENCED));
        assert!(!doms[1].can_access(0x2000_4000, 0x1000, Rights::READ));
        assert!(doms[1].mappings().next().is_none());
    }

    #[test]
    fn grant_removes_source_mapping() {
        let mut doms =
            [domain_with_partition(), MemDomain::new(), MemDomain::new()];
        let fpage = Fpage::new(0x2000_8000, 12, Rights::READ);
        // Partition-backed memory cannot be granted away...
        assert_eq!(
            map_page(&mut doms, 0, 1, fpage, 0x2000_8000, true),
            Err(MapError::NotMapped)
        );
        // ...but a held mapping can.
        map_page(&mut doms, 0, 1, fpage, 0x2000_8000, false).unwrap();
        map_page(&mut doms, 1, 2, fpage, 0x2000_8000, true).unwrap();
        assert!(doms[1].mapping_at(0x2000_8000).is_none());
        assert!(doms[2].mapping_at(0x2000_8000).is_some());
    }

    #[test]
    fn flush_clears_derived_mappings() {
        let mut doms =
            [domain_with_partition(), MemDomain::new(), MemDomain::new()];
        let fpage = Fpage::new(0x2000_4000, 12, Rights::READ);
        map_page(&mut doms, 0, 1, fpage, 0x2000_4000, false).unwrap();
        map_page(&mut doms, 1, 2, fpage, 0x2000_4000, false).unwrap();
        unmap_page(&mut doms, 1, fpage, true).unwrap();
        assert!(doms[2].mapping_at(0x2000_4000).is_none());
    }
}
