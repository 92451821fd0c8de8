//! The CIF service table. Each handler takes the
//! raw input cells and returns the raw output cells, mirroring the
//! source's `cif_handler_t(int nargs, int nrets, unsigned *args)` shape —
//! kept as a `match` over the service name rather than a function-pointer
//! table since Rust gives us exhaustiveness checking for free.

use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::pmem::{align_down, align_up, PAGE_SIZE};
use crate::ranges::RangeSet;
use crate::types::{AccessSize, Gea};
use crate::vmm::Vmm;

use super::claim::ClaimMode;
use super::ihandle::{IhandleKind, WrappedKind};
use super::{Cif, Phandle};

const NOT_FOUND: u32 = 0;
const ERR: u32 = u32::MAX;

pub fn dispatch(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, name: &str, args: &[u32]) -> Result<Vec<u32>> {
    match name {
        "child" => one(child(cif, args)),
        "peer" => one(peer(cif, args)),
        "parent" => one(parent(cif, args)),
        "instance-to-package" => one(instance_to_package(cif, args)),
        "instance-to-path" => instance_to_path(cif, guest, vmm, args),
        "package-to-path" => package_to_path(cif, guest, vmm, args),
        "finddevice" => one(finddevice(cif, guest, vmm, args)),
        "getprop" => getprop(cif, guest, vmm, args),
        "getproplen" => one(getproplen(cif, guest, vmm, args)),
        "open" => one(open(cif, guest, vmm, args)),
        "close" => {
            close(cif, args);
            Ok(vec![])
        }
        "seek" => one(seek(cif, args)),
        "read" => read(cif, guest, vmm, args).map(|n| vec![n]),
        "write" => write(cif, guest, vmm, args).map(|n| vec![n]),
        "claim" => one(claim(cif, args)),
        "call-method" => call_method(cif, guest, vmm, args),
        "milliseconds" => Ok(vec![cif.milliseconds()]),
        "exit" | "enter" | "boot" | "chain" => Err(Error::Shutdown),
        _ => Err(Error::Unsupported("unknown CIF service")),
    }
}

fn one(v: u32) -> Result<Vec<u32>> {
    Ok(vec![v])
}

fn phandle_arg(v: u32) -> Phandle {
    Phandle(v)
}

fn child(cif: &Cif, args: &[u32]) -> u32 {
    let path = match cif.path_of(phandle_arg(args[0])) {
        Ok(p) => p,
        Err(_) => return NOT_FOUND,
    };
    let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
    cif.paths
        .iter()
        .find(|p| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
        .and_then(|p| cif.phandle_of(p))
        .map_or(NOT_FOUND, |p| p.0)
}

/// `peer(0)` is the root-node convention.
fn peer(cif: &Cif, args: &[u32]) -> u32 {
    if args[0] == 0 {
        return cif.phandle_of("/").map_or(NOT_FOUND, |p| p.0);
    }
    let path = match cif.path_of(phandle_arg(args[0])) {
        Ok(p) => p.to_string(),
        Err(_) => return NOT_FOUND,
    };
    let (parent, leaf) = match path.rsplit_once('/') {
        Some((p, l)) => (if p.is_empty() { "/" } else { p }, l),
        None => return NOT_FOUND,
    };
    let prefix = if parent == "/" { "/".to_string() } else { format!("{parent}/") };
    let mut siblings: Vec<&String> = cif
        .paths
        .iter()
        .filter(|p| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
        .collect();
    siblings.sort();
    let pos = siblings.iter().position(|p| p.ends_with(leaf));
    match pos {
        Some(i) if i + 1 < siblings.len() => cif.phandle_of(siblings[i + 1]).map_or(NOT_FOUND, |p| p.0),
        _ => NOT_FOUND,
    }
}

fn parent(cif: &Cif, args: &[u32]) -> u32 {
    let path = match cif.path_of(phandle_arg(args[0])) {
        Ok(p) => p.to_string(),
        Err(_) => return NOT_FOUND,
    };
    if path == "/" {
        return NOT_FOUND;
    }
    let parent = path.rsplit_once('/').map(|(p, _)| if p.is_empty() { "/" } else { p }).unwrap_or("/");
    cif.phandle_of(parent).map_or(NOT_FOUND, |p| p.0)
}

fn instance_to_package(cif: &Cif, args: &[u32]) -> u32 {
    match cif.ihandle_phandle(args[0]) {
        Some(p) => p.0,
        None => ERR,
    }
}

fn instance_to_path(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<Vec<u32>> {
    let phandle = match cif.ihandle_phandle(args[0]) {
        Some(p) => p,
        None => return one(ERR),
    };
    write_path_string(cif, guest, vmm, phandle, args[1])
}

fn package_to_path(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<Vec<u32>> {
    write_path_string(cif, guest, vmm, phandle_arg(args[0]), args[1])
}

fn write_path_string(cif: &Cif, guest: &mut Guest, vmm: &mut Vmm, phandle: Phandle, buf_gea: u32) -> Result<Vec<u32>> {
    let path = match cif.path_of(phandle) {
        Ok(p) => p,
        Err(_) => return one(ERR),
    };
    let n = guest.guest_to(vmm, Gea(buf_gea), path.as_bytes(), AccessSize::Byte, true)?;
    one(n)
}

fn finddevice(cif: &Cif, guest: &Guest, vmm: &mut Vmm, args: &[u32]) -> u32 {
    let mut buf = [0u8; 256];
    let len = match guest.guest_from(vmm, Gea(args[0]), &mut buf, AccessSize::Byte, true, true) {
        Ok(n) => n as usize,
        Err(_) => return NOT_FOUND,
    };
    let path = match std::str::from_utf8(&buf[..len]) {
        Ok(p) => p,
        Err(_) => return NOT_FOUND,
    };
    cif.phandle_of(path).map_or(NOT_FOUND, |p| p.0)
}

/// Reads a NUL-terminated guest string at `gea`.
fn read_guest_string(guest: &Guest, vmm: &mut Vmm, gea: u32) -> Result<String> {
    let mut buf = [0u8; 256];
    let len = guest.guest_from(vmm, Gea(gea), &mut buf, AccessSize::Byte, true, true)? as usize;
    String::from_utf8(buf[..len].to_vec()).map_err(|_| Error::Invalid)
}

/// `getprop(phandle, name-gea, buf-gea, len) -> len_out`.
/// The memory node's `reg`/`available` are synthesized from the live
/// range sets rather than read from the static tree.
fn getprop(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<Vec<u32>> {
    let phandle = phandle_arg(args[0]);
    let name = read_guest_string(guest, vmm, args[1])?;
    let buf_gea = args[2];
    let maxlen = args[3];

    if phandle == cif.memory_phandle() {
        if let Some(bytes) = cif.synthesize_memory_prop(&name) {
            let n = bytes.len().min(maxlen as usize) as u32;
            guest.guest_to(vmm, Gea(buf_gea), &bytes[..n as usize], AccessSize::Byte, true)?;
            return one(n);
        }
    }

    match cif.raw_prop(phandle, &name) {
        Some(bytes) => {
            let n = bytes.len().min(maxlen as usize) as u32;
            guest.guest_to(vmm, Gea(buf_gea), &bytes[..n as usize], AccessSize::Byte, true)?;
            one(n)
        }
        None => one(ERR),
    }
}

fn getproplen(cif: &mut Cif, guest: &Guest, vmm: &mut Vmm, args: &[u32]) -> u32 {
    let phandle = phandle_arg(args[0]);
    let name = match read_guest_string(guest, vmm, args[1]) {
        Ok(n) => n,
        Err(_) => return ERR,
    };
    if phandle == cif.memory_phandle() {
        if let Some(bytes) = cif.synthesize_memory_prop(&name) {
            return bytes.len() as u32;
        }
    }
    cif.raw_prop(phandle, &name).map_or(ERR, |b| b.len() as u32)
}

/// `open(path-gea) -> ihandle`.
fn open(cif: &mut Cif, guest: &Guest, vmm: &mut Vmm, args: &[u32]) -> u32 {
    let path = match read_guest_string(guest, vmm, args[0]) {
        Ok(p) => p,
        Err(_) => return ERR,
    };
    cif.open_path(&path).unwrap_or(ERR)
}

fn close(cif: &mut Cif, args: &[u32]) {
    cif.close_ihandle(args[0]);
}

/// `seek(ihandle, hi, lo)`; asserts `hi == 0`.
fn seek(cif: &mut Cif, args: &[u32]) -> u32 {
    let (ihandle, hi, lo) = (args[0], args[1], args[2]);
    assert_eq!(hi, 0, "seek with nonzero high word is unsupported");
    match cif.seek_ihandle(ihandle, lo) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}

/// A mid-transfer `BadAccess` against the guest's buffer is a guest bug
/// reported back to the guest as a short count, not a failed CIF call
/// (`rom_read`'s `partial:` label).
fn read(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<u32> {
    let (ihandle, buf_gea, len) = (args[0], args[1], args[2]);
    let mut staging = vec![0u8; len as usize];
    let n = cif.read_ihandle(ihandle, &mut staging)?;
    guest.guest_to_lossy(vmm, Gea(buf_gea), &staging[..n as usize], AccessSize::Byte, true)
}

/// Same partial-success contract as [`read`], mirroring `rom_write`'s
/// `partial:` label: only the prefix actually read out of guest memory is
/// handed to the backing ihandle.
fn write(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<u32> {
    let (ihandle, buf_gea, len) = (args[0], args[1], args[2]);
    let mut staging = vec![0u8; len as usize];
    let n = guest.guest_from_lossy(vmm, Gea(buf_gea), &mut staging, AccessSize::Byte, true)?;
    cif.write_ihandle(ihandle, &staging[..n as usize])
}

/// `claim(addr, size, align) -> addr|-1`.
fn claim(cif: &mut Cif, args: &[u32]) -> u32 {
    let (addr, size, align) = (args[0], args[1], args[2]);
    let mode = if align == 0 { ClaimMode::Fixed(addr) } else { ClaimMode::Anywhere };
    cif.claim(mode, align, size).unwrap_or(ERR)
}

fn call_method(cif: &mut Cif, guest: &mut Guest, vmm: &mut Vmm, args: &[u32]) -> Result<Vec<u32>> {
    let method = read_guest_string(guest, vmm, args[0])?;
    let ihandle = args[1];

    match method.as_str() {
        "claim" if cif.is_memory_ihandle(ihandle) => {
            let (align, size, addr) = (args[2], args[3], args[4]);
            let mode = if align == 0 { ClaimMode::Fixed(addr) } else { ClaimMode::Anywhere };
            match cif.claim(mode, align, size) {
                Some(addr) => Ok(vec![0, addr]),
                None => Ok(vec![ERR, ERR]),
            }
        }
        "map" if cif.is_mmu_ihandle(ihandle) => {
            let (mode, size, virt, phys) = (args[2], args[3], args[4], args[5]);
            // A veneer-specific quirk encodes "default mode" as -2; coerce
            // to the real default sentinel -1 with a warning.
            let mode = if mode == 0xFFFF_FFFE {
                log::warn!(target: "pvp::cif", "call-method map: coercing mode -2 to -1");
                0xFFFF_FFFF
            } else {
                mode
            };
            if mode != 0xFFFF_FFFF {
                return Err(Error::Unsupported("call-method map: non-default mode"));
            }
            if phys != virt {
                cif.mmu_map(guest, virt, size, phys);
            }
            Ok(vec![0])
        }
        _ => Ok(vec![ERR]),
    }
}

impl Cif {
    fn memory_phandle(&self) -> Phandle {
        self.memory_phandle
    }

    fn ihandle_phandle(&self, ihandle: u32) -> Option<Phandle> {
        match self.ihandles.get_mut(ihandle)? {
            IhandleKind::Wrapped(WrappedKind::Plain(p)) => Some(*p),
            IhandleKind::Wrapped(WrappedKind::Console(_)) => self.phandle_of("/con"),
            _ => None,
        }
    }

    /// Synthesizes `reg`/`available` for the memory node from the live
    /// range sets; each entry is two
    /// cells: base, `size = limit - base + 1`.
    fn synthesize_memory_prop(&self, name: &str) -> Option<Vec<u8>> {
        let set: &RangeSet = match name {
            "reg" => &self.reg,
            "available" => &self.available,
            _ => return None,
        };
        let mut bytes = Vec::new();
        for r in set.iter() {
            bytes.extend_from_slice(&r.base.to_be_bytes());
            bytes.extend_from_slice(&(r.limit - r.base + 1).to_be_bytes());
        }
        Some(bytes)
    }

    /// Reads a raw property from the static device tree, re-encoding
    /// `u32` cell arrays big-endian (the `fdt` crate yields native-order
    /// values for typed accessors; raw byte properties pass through
    /// untouched, matching the device tree's own big-endian wire format).
    fn raw_prop(&self, phandle: Phandle, name: &str) -> Option<Vec<u8>> {
        let path = self.path_of(phandle).ok()?;
        let node = self.dt.find_node(path)?;
        node.property(name).map(|p| p.value.to_vec())
    }

    fn open_path(&mut self, path: &str) -> Result<u32> {
        let (dev, rest) = path.split_once(':').unwrap_or((path, ""));
        let phandle = self.phandle_of(dev).ok_or(Error::NotFound)?;
        let node_path = self.path_of(phandle)?.to_string();
        let node = self.dt.find_node(&node_path).ok_or(Error::NotFound)?;

        if let Some(disk_file) = node.property("disk_file") {
            let img = std::str::from_utf8(disk_file.value).map_err(|_| Error::Invalid)?.trim_end_matches('\0');
            let (part_str, _file) = rest.split_once(',').unwrap_or((rest, ""));
            let index: u32 = part_str.parse().unwrap_or(0);
            let p = std::path::Path::new(img);
            let part = self.disks.find_part(p, index)?;
            let file = self.disks.open(p)?;
            let handle = crate::disk::DiskHandle::new(file, part);
            return Ok(self.ihandles.insert(IhandleKind::Disk(handle)));
        }

        if !rest.is_empty() {
            let (_part, file_suffix) = rest.split_once(',').unwrap_or(("", rest));
            if !file_suffix.is_empty() {
                let f = std::fs::OpenOptions::new().read(true).write(true).open(file_suffix)?;
                return Ok(self.ihandles.insert(IhandleKind::File {
                    file: f,
                    path: std::path::PathBuf::from(file_suffix),
                }));
            }
        }

        if Some(phandle) == self.phandle_of("/con") {
            return Ok(self.con_ihandle);
        }

        Ok(self.ihandles.insert(IhandleKind::Wrapped(WrappedKind::Plain(phandle))))
    }

    fn close_ihandle(&mut self, ihandle: u32) {
        self.ihandles.close(ihandle);
    }

    fn seek_ihandle(&mut self, ihandle: u32, offset: u32) -> Result<()> {
        self.ihandles.get_mut(ihandle).ok_or(Error::NotFound)?.seek(offset)
    }

    fn read_ihandle(&mut self, ihandle: u32, buf: &mut [u8]) -> Result<u32> {
        self.ihandles.get_mut(ihandle).ok_or(Error::NotFound)?.read(buf)
    }

    fn write_ihandle(&mut self, ihandle: u32, buf: &[u8]) -> Result<u32> {
        self.ihandles.get_mut(ihandle).ok_or(Error::NotFound)?.write(buf)
    }

    fn claim(&mut self, mode: ClaimMode, align: u32, size: u32) -> Option<u32> {
        let ram_size = self.reg.iter().map(|r| r.limit + 1).max().unwrap_or(0);
        self.claim_arena.claim(&mut self.available, mode, align, size, ram_size)
    }

    fn is_memory_ihandle(&self, ihandle: u32) -> bool {
        self.ihandle_phandle(ihandle) == Some(self.memory_phandle)
    }

    fn is_mmu_ihandle(&self, ihandle: u32) -> bool {
        self.ihandle_phandle(ihandle) == Some(self.mmu_phandle)
    }

    /// `call-method "map"` backing. No hypervisor
    /// mapping is pre-installed; the page fault path materializes it
    /// lazily on first access.
    fn mmu_map(&mut self, guest: &mut Guest, virt: u32, size: u32, phys: u32) {
        let base = align_down(virt, PAGE_SIZE);
        let limit = align_up(virt + size, PAGE_SIZE);
        let ra_base = align_down(phys, PAGE_SIZE);
        guest.mmu_ranges.add(base, limit - 1, ra_base, 0);
    }
}
