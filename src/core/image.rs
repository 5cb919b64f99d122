//! Image orchestration
//!
//! [`ImageBuilder`] recognizes container signatures on an input store and
//! stacks the matching transforms into a reader tree. Filesystems found on
//! the leaves are mounted by name (`imgfs`, `xip`, `xip20`, `xip23`).
//!
//! Recognition order:
//! 1. optional sub-range of the input
//! 2. `B000FF` block chain
//! 3. `R000FF` signed blocks
//! 4. `HTCIMAGE` container, continuing with its OS section
//! 5. sector-tagged flash
//! 6. MBR partitions: XIP (optionally compressed) and IMGFS
//! 7. without a partition table: compressed XIP, XIP, then IMGFS
//!
//! A filesystem that fails to mount is logged and skipped.

use crate::allocator::OverlapPolicy;
use crate::compression::{SharedCodec, UnavailableCodec};
use crate::config::EngineConfig;
use crate::error::{FlashError, Result};
use crate::filesystem::{EntryInfo, Filesystem, FsKind, FsStats};
use crate::htc::{is_htc_image, HtcImage, HTC_OS_SECTION};
use crate::imgfs::{is_imgfs, Imgfs};
use crate::io::{FileStore, MmapStore, SharedStream};
use crate::module::ExeBuilder;
use crate::partition::{
    is_partition_table, FlashLayout, PartitionEntry, PartitionTable, PART_BOOT_XIP, PART_IMGFS,
    PART_UPDATE_XIP,
};
use crate::transform::{
    find_block_size, is_block_chain, is_compressed_region, is_signed_blocks, BlockChainView,
    BlockSigner, CompressedRegionView, OffsetView, SectorTagView, SignedBlockView,
};
use crate::xip::{is_xip, Xip, XipOptions};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Transform kind of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Store,
    Offset,
    BlockChain,
    Signed,
    HtcSection,
    SectorTag,
    Partition,
    CompressedRegion,
}

/// Outermost container recognized on a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    BlockChain,
    Signed,
    Htc,
    SectorTag,
    PartitionTable,
    CompressedRegion,
    Xip,
    Imgfs,
}

/// Check the signatures in dispatch order.
pub fn recognize(store: &SharedStream, xip_rva_base: Option<u32>) -> Option<Container> {
    if is_block_chain(store, 0) {
        Some(Container::BlockChain)
    } else if is_signed_blocks(store, 0) {
        Some(Container::Signed)
    } else if is_htc_image(store) {
        Some(Container::Htc)
    } else if find_block_size(store, 0).is_some() {
        Some(Container::SectorTag)
    } else if is_partition_table(store, 0) {
        Some(Container::PartitionTable)
    } else if is_compressed_region(store, 0) {
        Some(Container::CompressedRegion)
    } else if is_xip(store, xip_rva_base) {
        Some(Container::Xip)
    } else if is_imgfs(store, 0) {
        Some(Container::Imgfs)
    } else {
        None
    }
}

pub struct ReaderNode {
    pub name: String,
    pub parent: Option<usize>,
    pub layer: Layer,
    stream: SharedStream,
}

impl ReaderNode {
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }
}

/// A mounted filesystem
pub enum Mounted {
    Imgfs(Imgfs),
    Xip(Xip),
}

impl Mounted {
    pub fn as_fs(&self) -> &dyn Filesystem {
        match self {
            Mounted::Imgfs(fs) => fs,
            Mounted::Xip(fs) => fs,
        }
    }

    pub fn as_fs_mut(&mut self) -> &mut dyn Filesystem {
        match self {
            Mounted::Imgfs(fs) => fs,
            Mounted::Xip(fs) => fs,
        }
    }
}

struct Mount {
    name: String,
    reader: usize,
    fs: Mounted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReaderReport {
    pub name: String,
    pub parent: Option<String>,
    pub layer: Layer,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsReport {
    pub name: String,
    pub reader: String,
    pub kind: FsKind,
    pub stats: FsStats,
    pub entries: Vec<EntryInfo>,
}

/// Reader tree plus the mounted filesystems
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub readers: Vec<ReaderReport>,
    pub htc: Option<HtcImage>,
    pub partitions: Vec<PartitionEntry>,
    pub filesystems: Vec<FsReport>,
}

impl ImageReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of a batch over many entries
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fluent construction of an [`Image`]
///
/// ```rust,no_run
/// use flashfs::{ImageBuilder, PortableCodec, Result};
/// use std::sync::Arc;
///
/// # fn main() -> Result<()> {
/// let mut image = ImageBuilder::new()
///     .read_only(true)
///     .codec(Arc::new(PortableCodec))
///     .open_path("rom.nbh")?;
/// println!("{}", image.report().to_json()?);
/// image.close()?;
/// # Ok(())
/// # }
/// ```
pub struct ImageBuilder {
    config: EngineConfig,
    codec: SharedCodec,
    exe_builder: Option<Arc<dyn ExeBuilder>>,
    signer: Option<Arc<dyn BlockSigner>>,
    mmap: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            config: EngineConfig::default(),
            codec: Arc::new(UnavailableCodec),
            exe_builder: None,
            signer: None,
            mmap: false,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: SharedCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn exe_builder(mut self, builder: Arc<dyn ExeBuilder>) -> Self {
        self.exe_builder = Some(builder);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn BlockSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.config.overlap_policy = policy;
        self
    }

    pub fn xip_rva_base(mut self, base: u32) -> Self {
        self.config.xip_rva_base = Some(base);
        self
    }

    pub fn image_range(mut self, offset: u64, length: Option<u64>) -> Self {
        self.config.image_offset = Some(offset);
        self.config.image_length = length;
        self
    }

    /// Map the input file instead of reading it through `std::fs::File`
    pub fn mmap(mut self, mmap: bool) -> Self {
        self.mmap = mmap;
        self
    }

    pub fn open_path<P: AsRef<Path>>(self, path: P) -> Result<Image> {
        let read_only = self.config.read_only;
        tracing::info!(
            "opening {} ({})",
            path.as_ref().display(),
            if read_only { "read-only" } else { "read-write" }
        );
        let store = if self.mmap {
            SharedStream::new(MmapStore::open(path, read_only)?)
        } else {
            SharedStream::new(FileStore::open(path, read_only)?)
        };
        self.open_store(store)
    }

    /// Build the reader tree over `store` and mount what is found.
    pub fn open_store(self, store: SharedStream) -> Result<Image> {
        let mut image = Image {
            config: self.config,
            codec: self.codec,
            exe_builder: self.exe_builder,
            readers: Vec::new(),
            mounts: Vec::new(),
            htc: None,
            partitions: Vec::new(),
            closed: false,
        };
        let root = image.push_reader("image", None, Layer::Store, store);
        image.dispatch(root, self.signer)?;
        image.share_cpu_type();
        Ok(image)
    }
}

/// An opened firmware image
pub struct Image {
    config: EngineConfig,
    codec: SharedCodec,
    exe_builder: Option<Arc<dyn ExeBuilder>>,
    readers: Vec<ReaderNode>,
    mounts: Vec<Mount>,
    htc: Option<HtcImage>,
    partitions: Vec<PartitionEntry>,
    closed: bool,
}

impl Image {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ImageBuilder::new().open_path(path)
    }

    fn push_reader(
        &mut self,
        name: impl Into<String>,
        parent: Option<usize>,
        layer: Layer,
        stream: SharedStream,
    ) -> usize {
        let name = name.into();
        tracing::debug!("reader {}: {:?}, {:#x} bytes", name, layer, stream.size());
        self.readers.push(ReaderNode {
            name,
            parent,
            layer,
            stream,
        });
        self.readers.len() - 1
    }

    fn stream_of(&self, reader: usize) -> SharedStream {
        self.readers[reader].stream.clone()
    }

    fn dispatch(&mut self, root: usize, signer: Option<Arc<dyn BlockSigner>>) -> Result<()> {
        let mut current = root;

        if self.config.image_offset.is_some() || self.config.image_length.is_some() {
            let base = self.config.image_offset.unwrap_or(0);
            let view = OffsetView::new(self.stream_of(current), base, self.config.image_length)?;
            let view = SharedStream::new(view);
            current = self.push_reader("offset", Some(current), Layer::Offset, view);
        }

        if is_block_chain(&self.stream_of(current), 0) {
            let opened = BlockChainView::open(self.stream_of(current));
            if let Some(view) = fallback("B000FF", opened)? {
                tracing::info!(
                    "B000FF block chain: {} blocks, image start {:08x}",
                    view.block_count(),
                    view.image_start()
                );
                let view = SharedStream::new(view);
                current = self.push_reader("b000ff", Some(current), Layer::BlockChain, view);
            }
        }

        if is_signed_blocks(&self.stream_of(current), 0) {
            let opened = SignedBlockView::open(self.stream_of(current), signer);
            if let Some(view) = fallback("R000FF", opened)? {
                tracing::info!("R000FF signed container: {} blocks", view.block_count());
                let view = SharedStream::new(view);
                current = self.push_reader("r000ff", Some(current), Layer::Signed, view);
            }
        }

        if is_htc_image(&self.stream_of(current)) {
            let opened = self.open_htc(current);
            if let Some(os) = fallback("HTCIMAGE", opened)? {
                current = os;
            }
        }

        if let Some(block_size) = find_block_size(&self.stream_of(current), 0) {
            let opened = SectorTagView::open(self.stream_of(current), block_size);
            if let Some(view) = fallback("sector-tag", opened)? {
                let view = SharedStream::new(view);
                current = self.push_reader("sectortag", Some(current), Layer::SectorTag, view);
            }
        }

        let partitioned = if is_partition_table(&self.stream_of(current), 0) {
            let mounted = self.mount_partitions(current);
            fallback("partition table", mounted)?.is_some()
        } else {
            false
        };
        if !partitioned {
            self.mount_raw(current);
        }

        if self.mounts.is_empty() {
            tracing::warn!("no filesystem found");
        }
        Ok(())
    }

    fn open_htc(&mut self, current: usize) -> Result<usize> {
        let store = self.stream_of(current);
        let htc = HtcImage::read(&store)?;
        tracing::info!("HTCIMAGE for {}: {} sections", htc.device, htc.sections().len());

        let mut os = None;
        for section in htc.sections() {
            match htc.open_section(&store, section) {
                Ok(view) => {
                    let label = section.label();
                    let idx = self.push_reader(label, Some(current), Layer::HtcSection, view);
                    if section.kind == HTC_OS_SECTION && os.is_none() {
                        os = Some(idx);
                    }
                }
                Err(e) => tracing::warn!("HTCIMAGE section {}: {}", section.label(), e),
            }
        }
        self.htc = Some(htc);
        Ok(os.unwrap_or(current))
    }

    fn mount_partitions(&mut self, current: usize) -> Result<()> {
        let store = self.stream_of(current);
        let mut sector_size = self.config.partition_sector_size;
        if let Some((size, layout)) = FlashLayout::locate(&store) {
            tracing::info!(
                "MSFLSH50 layout: {:#x}-byte sectors, {} regions",
                size,
                layout.regions.len()
            );
            sector_size = size;
        }
        let table = PartitionTable::read(&store, 0, sector_size)?;
        let total = store.size();

        for part in table.partitions() {
            self.partitions.push(*part);
            let start = part.start();
            if start >= total {
                tracing::warn!("partition {:02x} starts beyond the image", part.kind);
                continue;
            }
            let mut size = part.size();
            if size > total - start {
                tracing::warn!(
                    "partition {:02x} beyond image: resizing {:#x} -> {:#x}",
                    part.kind,
                    size,
                    total - start
                );
                size = total - start;
            }
            if size == 0 {
                continue;
            }

            let view = OffsetView::new(store.clone(), start, Some(size))?;
            let name = format!("part{:02x}", part.kind);
            let view = SharedStream::new(view);
            let reader = self.push_reader(name, Some(current), Layer::Partition, view);
            match part.kind {
                PART_UPDATE_XIP | PART_BOOT_XIP => {
                    let suffix = format!("{:02x}", part.kind);
                    self.mount_xip(reader, &suffix);
                }
                PART_IMGFS => self.mount_imgfs(reader),
                _ => {}
            }
        }
        Ok(())
    }

    fn mount_raw(&mut self, current: usize) {
        self.mount_xip(current, "");
        if is_imgfs(&self.stream_of(current), 0) {
            self.mount_imgfs(current);
        }
    }

    /// Mount an XIP region, unwrapping a compressed region first.
    fn mount_xip(&mut self, mut reader: usize, suffix: &str) {
        let base = self.config.xip_rva_base;
        if is_compressed_region(&self.stream_of(reader), 0) {
            let cache = self.config.decompressed_block_cache;
            match CompressedRegionView::open(self.stream_of(reader), self.codec.clone(), cache) {
                Ok(view) => {
                    let name = format!("cxip{}", suffix);
                    let view = SharedStream::new(view);
                    reader = self.push_reader(name, Some(reader), Layer::CompressedRegion, view);
                }
                Err(e) => {
                    tracing::warn!("compressed xip{}: {}", suffix, e);
                    return;
                }
            }
        }
        if !is_xip(&self.stream_of(reader), base) {
            if !suffix.is_empty() {
                tracing::info!("partition {} is not xip", suffix);
            }
            return;
        }
        let options = XipOptions {
            rva_base: base,
            legacy_layout: self.config.legacy_xip(),
            overlap_policy: self.config.overlap_policy,
        };
        let name = format!("xip{}", suffix);
        match Xip::open_with(self.stream_of(reader), self.codec.clone(), options) {
            Ok(mut xip) => {
                if let Some(builder) = &self.exe_builder {
                    xip.set_exe_builder(builder.clone());
                }
                self.add_mount(name, reader, Mounted::Xip(xip));
            }
            Err(e) => tracing::warn!("{}: {}", name, e),
        }
    }

    fn mount_imgfs(&mut self, reader: usize) {
        let policy = self.config.overlap_policy;
        match Imgfs::open_with_policy(self.stream_of(reader), self.codec.clone(), policy) {
            Ok(mut fs) => {
                if let Some(builder) = &self.exe_builder {
                    fs.set_exe_builder(builder.clone());
                }
                fs.set_legacy_e32(self.config.legacy_xip());
                self.add_mount("imgfs".to_string(), reader, Mounted::Imgfs(fs));
            }
            Err(e) => tracing::warn!("imgfs: {}", e),
        }
    }

    fn add_mount(&mut self, name: String, reader: usize, fs: Mounted) {
        tracing::info!("mounted {} on {}", name, self.readers[reader].name);
        self.mounts.push(Mount { name, reader, fs });
    }

    /// Module reconstruction in the IMGFS needs the boot XIP's CPU type.
    fn share_cpu_type(&mut self) {
        let cpu = ["xip23", "xip"].iter().find_map(|name| match self.filesystem(name) {
            Some(Mounted::Xip(xip)) => Some(xip.cpu_type()),
            _ => None,
        });
        let Some(cpu) = cpu else {
            return;
        };
        if let Some(Mounted::Imgfs(fs)) = self.filesystem_mut("imgfs") {
            tracing::debug!("imgfs cpu type {:#06x}", cpu);
            fs.set_cpu_type(cpu);
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn readers(&self) -> &[ReaderNode] {
        &self.readers
    }

    pub fn reader(&self, name: &str) -> Option<&SharedStream> {
        self.readers.iter().find(|r| r.name == name).map(|r| &r.stream)
    }

    pub fn htc(&self) -> Option<&HtcImage> {
        self.htc.as_ref()
    }

    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    /// Names of the mounted filesystems in mount order
    pub fn filesystem_names(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn filesystem(&self, name: &str) -> Option<&Mounted> {
        self.mounts.iter().find(|m| m.name == name).map(|m| &m.fs)
    }

    pub fn filesystem_mut(&mut self, name: &str) -> Option<&mut Mounted> {
        self.mounts.iter_mut().find(|m| m.name == name).map(|m| &mut m.fs)
    }

    fn require(&self, name: &str) -> Result<&dyn Filesystem> {
        self.filesystem(name)
            .map(Mounted::as_fs)
            .ok_or_else(|| FlashError::NotFound(format!("filesystem {}", name)))
    }

    pub fn report(&self) -> ImageReport {
        let readers = self
            .readers
            .iter()
            .map(|r| ReaderReport {
                name: r.name.clone(),
                parent: r.parent.map(|p| self.readers[p].name.clone()),
                layer: r.layer,
                size: r.stream.size(),
            })
            .collect();
        let filesystems = self
            .mounts
            .iter()
            .map(|m| {
                let fs = m.fs.as_fs();
                FsReport {
                    name: m.name.clone(),
                    reader: self.readers[m.reader].name.clone(),
                    kind: fs.kind(),
                    stats: fs.stats(),
                    entries: fs.entries(),
                }
            })
            .collect();
        ImageReport {
            readers,
            htc: self.htc.clone(),
            partitions: self.partitions.clone(),
            filesystems,
        }
    }

    /// Extract every entry of one filesystem into `sink`.
    ///
    /// A failing entry is recorded and the batch continues. Errors from the
    /// sink abort the batch.
    pub fn extract_all<F>(&self, fs_name: &str, mut sink: F) -> Result<BatchReport>
    where
        F: FnMut(&EntryInfo, &[u8]) -> Result<()>,
    {
        let fs = self.require(fs_name)?;
        let mut report = BatchReport::default();
        for entry in fs.entries() {
            match fs.extract(&entry.name) {
                Ok(data) => {
                    sink(&entry, &data)?;
                    report.succeeded.push(entry.name);
                }
                Err(e) => {
                    tracing::warn!("{}: extracting {} failed: {}", fs_name, entry.name, e);
                    report.failed.push(BatchFailure {
                        name: entry.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            "{}: extracted {} entries, {} failed",
            fs_name,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Extract every entry of one filesystem as files under `dir`.
    ///
    /// Entries whose name is not a single plain file name are reported as
    /// failed and never written.
    pub fn extract_to_dir<P: AsRef<Path>>(&self, fs_name: &str, dir: P) -> Result<BatchReport> {
        let dir = dir.as_ref();
        let fs = self.require(fs_name)?;
        std::fs::create_dir_all(dir)?;
        let mut report = BatchReport::default();
        for entry in fs.entries() {
            let written = match host_file_name(&entry.name) {
                Some(file) => fs
                    .extract(&entry.name)
                    .and_then(|data| Ok(std::fs::write(dir.join(file), data)?)),
                None => Err(FlashError::Unsupported(format!(
                    "{:?} is not a plain file name",
                    entry.name
                ))),
            };
            match written {
                Ok(()) => report.succeeded.push(entry.name),
                Err(e) => {
                    tracing::warn!("{}: extracting {} failed: {}", fs_name, entry.name, e);
                    report.failed.push(BatchFailure {
                        name: entry.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            "{}: wrote {} entries to {}, {} failed",
            fs_name,
            report.succeeded.len(),
            dir.display(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Flush filesystems, then readers from the top view down to the base store.
    ///
    /// Only the first call does any work. Every layer is flushed even when an
    /// earlier one fails; the first error is returned.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_err = None;
        for mount in &mut self.mounts {
            if let Err(e) = mount.fs.as_fs_mut().flush() {
                tracing::warn!("flushing {} failed: {}", mount.name, e);
                first_err.get_or_insert(e);
            }
        }
        for reader in self.readers.iter().rev() {
            if let Err(e) = reader.stream.flush() {
                tracing::warn!("flushing reader {} failed: {}", reader.name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Turn a structural mismatch into "not this format" so detection moves on.
/// The entry name as a single path component, if it is one on every host.
fn host_file_name(name: &str) -> Option<&Path> {
    if name.is_empty() || name.contains(['/', '\\', ':', '\0']) {
        return None;
    }
    let path = Path::new(name);
    let mut parts = path.components();
    match (parts.next(), parts.next()) {
        (Some(std::path::Component::Normal(_)), None) => Some(path),
        _ => None,
    }
}

fn fallback<T>(what: &str, opened: Result<T>) -> Result<Option<T>> {
    match opened {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_format() => {
            tracing::warn!("{} signature found but not usable: {}", what, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing image failed: {}", e);
        }
    }
}
