//! FAT16 filesystem over the block cache
//!
//! Short names only (8.3, case-insensitive); no long-filename entries,
//! no journaling. Cluster chains terminate at values >= 0xFFF8; both FAT
//! copies are kept in sync on every allocation and free.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::cache::BlockCache;
use super::FsBackend;
use crate::error::FsError;

/// The only sector size the mount accepts.
const SECTOR: usize = 512;

/// Directory entry size on disk.
const DIRENT_SIZE: usize = 32;

/// End-of-chain marker written when linking a fresh chain.
const CHAIN_END: u16 = 0xFFFF;

/// Any FAT value at or above this terminates a chain.
const CHAIN_TERMINATOR: u16 = 0xFFF8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

impl Attributes {
    /// Long-filename entries carry all four low bits; they are skipped.
    fn is_lfn(self) -> bool {
        self.bits() & 0x0F == 0x0F
    }
}

/// A directory entry plus the sector/offset it was parsed from, so the
/// write path can update it in place.
#[derive(Debug, Clone)]
struct Located {
    name: [u8; 11],
    attr: Attributes,
    start_cluster: u16,
    size: u32,
    sector: u64,
    offset: usize,
}

impl Located {
    fn parse(raw: &[u8], sector: u64, offset: usize) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            name,
            attr: Attributes::from_bits_truncate(raw[11]),
            start_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
            sector,
            offset,
        }
    }

    fn is_dir(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }
}

/// Where a directory's entries live: the fixed root region, or a cluster
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirLocation {
    Root,
    Cluster(u16),
}

/// Parsed BPB plus derived layout, held for the life of the mount.
pub struct Fat16 {
    cache: Arc<Mutex<BlockCache>>,
    sectors_per_cluster: usize,
    reserved_sectors: usize,
    num_fats: usize,
    max_root_entries: usize,
    total_sectors: usize,
    fat_size_sectors: usize,
    first_data_sector: usize,
    root_dir_sector: usize,
}

impl Fat16 {
    /// Parse the BPB from block 0 and validate the geometry. 512-byte
    /// sectors are required; anything else is rejected at mount.
    pub fn mount_with_cache(cache: Arc<Mutex<BlockCache>>) -> Result<Self, FsError> {
        if cache.lock().block_size() != SECTOR {
            return Err(FsError::BadSuperblock);
        }
        let mut bpb = [0u8; SECTOR];
        cache.lock().read(0, &mut bpb)?;

        let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as usize;
        let sectors_per_cluster = bpb[13] as usize;
        let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as usize;
        let num_fats = bpb[16] as usize;
        let max_root_entries = u16::from_le_bytes([bpb[17], bpb[18]]) as usize;
        let total16 = u16::from_le_bytes([bpb[19], bpb[20]]) as usize;
        let fat_size_sectors = u16::from_le_bytes([bpb[22], bpb[23]]) as usize;
        let total32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as usize;
        let total_sectors = if total16 != 0 { total16 } else { total32 };

        if bytes_per_sector != SECTOR
            || sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || !(1..=2).contains(&num_fats)
            || max_root_entries == 0
            || fat_size_sectors == 0
            || total_sectors == 0
        {
            return Err(FsError::BadSuperblock);
        }

        let root_dir_sector = reserved_sectors + num_fats * fat_size_sectors;
        let root_dir_sectors = (max_root_entries * DIRENT_SIZE).div_ceil(SECTOR);
        let first_data_sector = root_dir_sector + root_dir_sectors;
        if first_data_sector >= total_sectors {
            return Err(FsError::BadSuperblock);
        }

        Ok(Self {
            cache,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            max_root_entries,
            total_sectors,
            fat_size_sectors,
            first_data_sector,
            root_dir_sector,
        })
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster * SECTOR
    }

    /// Clusters 2..max_cluster are data clusters.
    fn max_cluster(&self) -> u16 {
        let data_sectors = self.total_sectors - self.first_data_sector;
        (data_sectors / self.sectors_per_cluster + 2).min(0xFFF0) as u16
    }

    fn cluster_sector(&self, cluster: u16) -> u64 {
        (self.first_data_sector + (cluster as usize - 2) * self.sectors_per_cluster) as u64
    }

    // --- FAT access ------------------------------------------------------

    fn fat_entry(&self, cluster: u16) -> Result<u16, FsError> {
        let byte = cluster as usize * 2;
        let sector = (self.reserved_sectors + byte / SECTOR) as u64;
        let mut buf = [0u8; SECTOR];
        self.cache.lock().read(sector, &mut buf)?;
        let off = byte % SECTOR;
        Ok(u16::from_le_bytes([buf[off], buf[off + 1]]))
    }

    /// Write one FAT entry into every FAT copy.
    fn set_fat_entry(&self, cluster: u16, value: u16) -> Result<(), FsError> {
        let byte = cluster as usize * 2;
        let rel_sector = byte / SECTOR;
        let off = byte % SECTOR;
        let mut cache = self.cache.lock();
        for copy in 0..self.num_fats {
            let sector =
                (self.reserved_sectors + copy * self.fat_size_sectors + rel_sector) as u64;
            let mut buf = [0u8; SECTOR];
            cache.read(sector, &mut buf)?;
            buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
            cache.write(sector, &buf)?;
        }
        Ok(())
    }

    fn next_cluster(&self, cluster: u16) -> Result<Option<u16>, FsError> {
        let entry = self.fat_entry(cluster)?;
        if entry >= CHAIN_TERMINATOR {
            Ok(None)
        } else if entry < 2 {
            Err(FsError::TruncatedChain)
        } else {
            Ok(Some(entry))
        }
    }

    /// Claim `count` free clusters and link them, terminating the chain.
    fn alloc_chain(&self, count: usize) -> Result<Vec<u16>, FsError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut chain = Vec::with_capacity(count);
        for cluster in 2..self.max_cluster() {
            if self.fat_entry(cluster)? == 0 {
                chain.push(cluster);
                if chain.len() == count {
                    break;
                }
            }
        }
        if chain.len() < count {
            return Err(FsError::NoSpace);
        }
        for pair in chain.windows(2) {
            self.set_fat_entry(pair[0], pair[1])?;
        }
        self.set_fat_entry(*chain.last().expect("count > 0"), CHAIN_END)?;
        Ok(chain)
    }

    fn free_chain(&self, start: u16) -> Result<(), FsError> {
        let mut cluster = start;
        loop {
            let entry = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            if entry >= CHAIN_TERMINATOR || entry < 2 {
                return Ok(());
            }
            cluster = entry;
        }
    }

    // --- directory scan --------------------------------------------------

    /// Sectors making up a directory, in order.
    fn dir_sectors(&self, dir: DirLocation) -> Result<Vec<u64>, FsError> {
        match dir {
            DirLocation::Root => {
                let count = (self.max_root_entries * DIRENT_SIZE).div_ceil(SECTOR);
                Ok((0..count)
                    .map(|i| (self.root_dir_sector + i) as u64)
                    .collect())
            }
            DirLocation::Cluster(start) => {
                let mut sectors = Vec::new();
                let mut cluster = Some(start);
                while let Some(c) = cluster {
                    let base = self.cluster_sector(c);
                    for i in 0..self.sectors_per_cluster {
                        sectors.push(base + i as u64);
                    }
                    cluster = self.next_cluster(c)?;
                }
                Ok(sectors)
            }
        }
    }

    /// Visit live entries until `visit` returns `Some`. The `0x00` name
    /// byte ends the scan; `0xE5` and LFN entries are skipped.
    fn scan_dir<T>(
        &self,
        dir: DirLocation,
        mut visit: impl FnMut(&Located) -> Option<T>,
    ) -> Result<Option<T>, FsError> {
        for sector in self.dir_sectors(dir)? {
            let mut buf = [0u8; SECTOR];
            self.cache.lock().read(sector, &mut buf)?;
            for off in (0..SECTOR).step_by(DIRENT_SIZE) {
                let raw = &buf[off..off + DIRENT_SIZE];
                match raw[0] {
                    0x00 => return Ok(None),
                    0xE5 => continue,
                    _ => {}
                }
                let entry = Located::parse(raw, sector, off);
                if entry.attr.is_lfn() || entry.attr.contains(Attributes::VOLUME_ID) {
                    continue;
                }
                if let Some(t) = visit(&entry) {
                    return Ok(Some(t));
                }
            }
        }
        Ok(None)
    }

    fn find_in_dir(&self, dir: DirLocation, shortname: &[u8; 11]) -> Result<Located, FsError> {
        self.scan_dir(dir, |entry| (&entry.name == shortname).then(|| entry.clone()))?
            .ok_or(FsError::NotFound)
    }

    /// Resolve a path to its directory entry, walking from the root.
    fn resolve(&self, path: &str) -> Result<Located, FsError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut dir = DirLocation::Root;
        let mut current: Option<Located> = None;
        while let Some(component) = components.next() {
            if let Some(entry) = current.take() {
                if !entry.is_dir() {
                    return Err(FsError::NotADirectory);
                }
                dir = DirLocation::Cluster(entry.start_cluster);
            }
            let shortname = short_name(component).ok_or(FsError::NotFound)?;
            let entry = self.find_in_dir(dir, &shortname)?;
            if components.peek().is_some() && !entry.is_dir() {
                return Err(FsError::NotADirectory);
            }
            current = Some(entry);
        }
        current.ok_or(FsError::NotFound)
    }

    /// Resolve a path that names a directory (including "/").
    fn resolve_dir(&self, path: &str) -> Result<DirLocation, FsError> {
        if path.split('/').all(|c| c.is_empty()) {
            return Ok(DirLocation::Root);
        }
        let entry = self.resolve(path)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(DirLocation::Cluster(entry.start_cluster))
    }

    fn split_parent(path: &str) -> (&str, &str) {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        }
    }

    /// Rewrite a directory entry in place.
    fn update_dirent(
        &self,
        entry: &Located,
        start_cluster: u16,
        size: u32,
    ) -> Result<(), FsError> {
        let mut buf = [0u8; SECTOR];
        let mut cache = self.cache.lock();
        cache.read(entry.sector, &mut buf)?;
        let off = entry.offset;
        buf[off + 26..off + 28].copy_from_slice(&start_cluster.to_le_bytes());
        buf[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
        cache.write(entry.sector, &buf)?;
        Ok(())
    }

    /// Claim a free slot in `dir` and write a fresh entry into it.
    fn create_dirent(
        &self,
        dir: DirLocation,
        shortname: &[u8; 11],
        start_cluster: u16,
        size: u32,
    ) -> Result<(), FsError> {
        for sector in self.dir_sectors(dir)? {
            let mut buf = [0u8; SECTOR];
            self.cache.lock().read(sector, &mut buf)?;
            for off in (0..SECTOR).step_by(DIRENT_SIZE) {
                if buf[off] == 0x00 || buf[off] == 0xE5 {
                    buf[off..off + DIRENT_SIZE].fill(0);
                    buf[off..off + 11].copy_from_slice(shortname);
                    buf[off + 11] = Attributes::ARCHIVE.bits();
                    buf[off + 26..off + 28].copy_from_slice(&start_cluster.to_le_bytes());
                    buf[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
                    self.cache.lock().write(sector, &buf)?;
                    return Ok(());
                }
            }
        }
        Err(FsError::NoSpace)
    }

    // --- public operations -----------------------------------------------

    /// Read up to `buf.len()` bytes of a file; returns the byte count.
    pub fn read_file(&self, path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        let entry = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let want = buf.len().min(entry.size as usize);
        if want == 0 || entry.start_cluster < 2 {
            return Ok(0);
        }
        let mut copied = 0;
        let mut cluster = Some(entry.start_cluster);
        let mut sector_buf = [0u8; SECTOR];
        while let Some(c) = cluster {
            let base = self.cluster_sector(c);
            for i in 0..self.sectors_per_cluster {
                if copied >= want {
                    return Ok(copied);
                }
                self.cache.lock().read(base + i as u64, &mut sector_buf)?;
                let n = (want - copied).min(SECTOR);
                buf[copied..copied + n].copy_from_slice(&sector_buf[..n]);
                copied += n;
            }
            cluster = self.next_cluster(c)?;
        }
        if copied < want {
            return Err(FsError::TruncatedChain);
        }
        Ok(copied)
    }

    /// Truncating overwrite: free the old chain, allocate a fresh one of
    /// `ceil(len / cluster_bytes)` clusters, write the payload, update
    /// the directory entry (creating it if missing).
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        let (parent, name) = Self::split_parent(path);
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        let shortname = short_name(name).ok_or(FsError::NotFound)?;
        let dir = self.resolve_dir(parent)?;

        let existing = match self.find_in_dir(dir, &shortname) {
            Ok(entry) => {
                if entry.is_dir() {
                    return Err(FsError::IsADirectory);
                }
                Some(entry)
            }
            Err(FsError::NotFound) => None,
            Err(e) => return Err(e),
        };

        if let Some(ref entry) = existing {
            if entry.start_cluster >= 2 {
                self.free_chain(entry.start_cluster)?;
            }
        }

        let start_cluster = if data.is_empty() {
            0
        } else {
            let chain = self.alloc_chain(data.len().div_ceil(self.cluster_bytes()))?;
            let mut written = 0;
            let mut sector_buf = [0u8; SECTOR];
            for &cluster in &chain {
                let base = self.cluster_sector(cluster);
                for i in 0..self.sectors_per_cluster {
                    let n = (data.len() - written).min(SECTOR);
                    sector_buf[..n].copy_from_slice(&data[written..written + n]);
                    sector_buf[n..].fill(0);
                    self.cache.lock().write(base + i as u64, &sector_buf)?;
                    written = (written + n).min(data.len());
                }
            }
            chain[0]
        };

        match existing {
            Some(entry) => self.update_dirent(&entry, start_cluster, data.len() as u32)?,
            None => self.create_dirent(dir, &shortname, start_cluster, data.len() as u32)?,
        }
        Ok(data.len())
    }

    pub fn get_file_size(&self, path: &str) -> Result<usize, FsError> {
        Ok(self.resolve(path)?.size as usize)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let dir = self.resolve_dir(path)?;
        let mut names = Vec::new();
        self.scan_dir(dir, |entry| {
            names.push(display_name(&entry.name));
            None::<()>
        })?;
        Ok(names)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.resolve_dir(path), Ok(_))
    }

    /// Flush the cache under the mount.
    pub fn sync(&self) -> Result<(), FsError> {
        self.cache.lock().flush()?;
        Ok(())
    }
}

/// Mount probe for the VFS backend registry.
pub fn probe(cache: Arc<Mutex<BlockCache>>) -> Result<Arc<dyn FsBackend>, FsError> {
    Fat16::mount_with_cache(cache).map(|fs| Arc::new(fs) as Arc<dyn FsBackend>)
}

impl FsBackend for Fat16 {
    fn name(&self) -> &'static str {
        "fat16"
    }

    fn read_file(&self, path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        Fat16::read_file(self, path, buf)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        Fat16::write_file(self, path, data)
    }

    fn file_size(&self, path: &str) -> Result<usize, FsError> {
        Fat16::get_file_size(self, path)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        Fat16::list_dir(self, path)
    }

    fn is_dir(&self, path: &str) -> bool {
        Fat16::is_dir(self, path)
    }
}

/// Uppercase 8.3 short name from a path component; `None` when the
/// component cannot be represented.
fn short_name(component: &str) -> Option<[u8; 11]> {
    let mut out = [b' '; 11];
    let (base, ext) = match component.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (component, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    for (i, c) in base.bytes().enumerate() {
        if !c.is_ascii() || c == b'/' {
            return None;
        }
        out[i] = c.to_ascii_uppercase();
    }
    for (i, c) in ext.bytes().enumerate() {
        if !c.is_ascii() || c == b'/' {
            return None;
        }
        out[8 + i] = c.to_ascii_uppercase();
    }
    Some(out)
}

/// "README  MD " -> "README.MD"
fn display_name(shortname: &[u8; 11]) -> String {
    let base = core::str::from_utf8(&shortname[..8]).unwrap_or("").trim_end();
    let ext = core::str::from_utf8(&shortname[8..]).unwrap_or("").trim_end();
    let mut s = String::from(base);
    if !ext.is_empty() {
        s.push('.');
        s.push_str(ext);
    }
    s
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::fs::blockdev::{BlockDevice, RamDisk};

    /// Format a tiny FAT16 volume: 1 reserved sector, 2 one-sector FATs,
    /// 32 root entries, 1 sector per cluster, 128 sectors total.
    fn mkfs() -> Arc<Mutex<BlockCache>> {
        let disk = Arc::new(RamDisk::new(128));
        let mut bpb = [0u8; SECTOR];
        bpb[11..13].copy_from_slice(&512u16.to_le_bytes());
        bpb[13] = 1; // sectors per cluster
        bpb[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        bpb[16] = 2; // FAT copies
        bpb[17..19].copy_from_slice(&32u16.to_le_bytes()); // root entries
        bpb[19..21].copy_from_slice(&128u16.to_le_bytes()); // total sectors
        bpb[22..24].copy_from_slice(&1u16.to_le_bytes()); // FAT size
        bpb[510] = 0x55;
        bpb[511] = 0xAA;
        disk.write_sectors(0, &bpb).unwrap();
        // Reserve FAT entries 0 and 1 with the media marker.
        let mut fat = [0u8; SECTOR];
        fat[0] = 0xF8;
        fat[1] = 0xFF;
        fat[2] = 0xFF;
        fat[3] = 0xFF;
        disk.write_sectors(1, &fat).unwrap();
        disk.write_sectors(2, &fat).unwrap();
        let cache =
            BlockCache::new(disk as Arc<dyn BlockDevice>, SECTOR, 16).unwrap();
        Arc::new(Mutex::new(cache))
    }

    fn mounted() -> Fat16 {
        Fat16::mount_with_cache(mkfs()).unwrap()
    }

    #[test]
    fn mount_validates_geometry() {
        let fs = mounted();
        assert_eq!(fs.root_dir_sector, 3);
        assert_eq!(fs.first_data_sector, 5);

        // A corrupt sector size must be rejected.
        let disk = Arc::new(RamDisk::new(16));
        let cache = BlockCache::new(
            disk as Arc<dyn BlockDevice>,
            SECTOR,
            4,
        )
        .unwrap();
        assert!(matches!(
            Fat16::mount_with_cache(Arc::new(Mutex::new(cache))),
            Err(FsError::BadSuperblock)
        ));
    }

    #[test]
    fn write_read_round_trip() {
        let fs = mounted();
        let data: Vec<u8> = (0..1300u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(fs.write_file("/data.bin", &data).unwrap(), data.len());
        assert_eq!(fs.get_file_size("/data.bin").unwrap(), data.len());

        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.read_file("/data.bin", &mut back).unwrap(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn truncating_overwrite_frees_old_chain() {
        let fs = mounted();
        let big = vec![1u8; 3 * 512];
        fs.write_file("/f.txt", &big).unwrap();
        let small = b"tiny";
        fs.write_file("/f.txt", small).unwrap();
        assert_eq!(fs.get_file_size("/f.txt").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(fs.read_file("/f.txt", &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], small);

        // The three old clusters must be free again: writing a file that
        // needs nearly the full volume still succeeds.
        let free_clusters = (2..fs.max_cluster())
            .filter(|&c| fs.fat_entry(c).unwrap() == 0)
            .count();
        assert_eq!(free_clusters, (fs.max_cluster() - 2) as usize - 1);
    }

    #[test]
    fn both_fat_copies_stay_in_sync() {
        let fs = mounted();
        fs.write_file("/s.txt", &[9u8; 600]).unwrap();
        fs.sync().unwrap();
        let mut fat0 = [0u8; SECTOR];
        let mut fat1 = [0u8; SECTOR];
        fs.cache.lock().read(1, &mut fat0).unwrap();
        fs.cache.lock().read(2, &mut fat1).unwrap();
        assert_eq!(fat0, fat1);
    }

    #[test]
    fn shortname_match_is_case_insensitive() {
        let fs = mounted();
        fs.write_file("/ReadMe.md", b"hi\n").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_file("/README.MD", &mut buf).unwrap(), 3);
        assert_eq!(fs.read_file("/readme.md", &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
    }

    #[test]
    fn listing_and_missing_paths() {
        let fs = mounted();
        fs.write_file("/a.txt", b"a").unwrap();
        fs.write_file("/b.bin", b"b").unwrap();
        let names = fs.list_dir("/").unwrap();
        assert_eq!(names, vec![String::from("A.TXT"), String::from("B.BIN")]);
        assert!(fs.is_dir("/"));
        assert!(!fs.is_dir("/a.txt"));
        assert!(matches!(
            fs.get_file_size("/nope.txt"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn empty_file_has_no_chain() {
        let fs = mounted();
        fs.write_file("/empty", b"").unwrap();
        assert_eq!(fs.get_file_size("/empty").unwrap(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_file("/empty", &mut buf).unwrap(), 0);
    }

    #[test]
    fn volume_fills_up() {
        let fs = mounted();
        let capacity = (fs.max_cluster() - 2) as usize * 512;
        assert!(fs.write_file("/big.bin", &vec![3u8; capacity]).is_ok());
        assert!(matches!(
            fs.write_file("/more.bin", &[1u8; 512]),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn short_name_formatting() {
        assert_eq!(short_name("kernel.bin").unwrap(), *b"KERNEL  BIN");
        assert_eq!(short_name("a").unwrap(), *b"A          ");
        assert!(short_name("waytoolongname.txt").is_none());
        assert_eq!(display_name(b"README  MD "), "README.MD");
        assert_eq!(display_name(b"FONTS      "), "FONTS");
    }
}
