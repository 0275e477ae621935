// ============================================================================
// src/nvme/prp.rs - PRP Buffer Descriptor
// ============================================================================
//!
//! コマンドとデータバッファの関連付け（PRPディスクリプタ）
//!
//! 各コマンドは0個または1個のバッファを持ち、どのPRPフィールドで
//! バッファを記述するかをビットマスクで記録する。コマンド種別ごとに
//! 許可されるビットマスクは構築時に固定され、それ以外の配置は
//! ハードウェア動作が未定義となるため事前に拒否する。
//!
//! ## バッファの種類
//! - 読み書き可能（`SharedMemBuffer`）: テストが所有するユーザーデータ
//! - 読み取り専用（`RoRegion`）: ドライバ所有のキューメモリへの参照。
//!   I/Oキュー作成コマンドとデバッグ用の検査にのみ使う

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::ptr::NonNull;

use crate::error::{ConformanceError, Result};
use crate::nvme::defs::PRP_ENTRIES_PER_PAGE;
use crate::nvme::mem_buffer::SharedMemBuffer;
use crate::nvme::ring::RingMemory;

// ============================================================================
// Data Direction
// ============================================================================

/// データ転送方向（ホスト側でのみ追跡、ワイヤ上のフィールドではない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    /// データ転送なし
    None,
    /// デバイス → ホスト
    FromDevice,
    /// ホスト → デバイス
    ToDevice,
    /// 双方向
    Bidirectional,
}

// ============================================================================
// PRP Bitmask
// ============================================================================

bitflags! {
    /// コマンドのどのポインタフィールドをどう埋めるか
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrpBitmask: u32 {
        /// PRP1 = データの先頭ページ
        const PRP1_PAGE = 1 << 0;
        /// PRP1 = 全ページを列挙したPRPリスト
        const PRP1_LIST = 1 << 1;
        /// PRP2 = データの2ページ目
        const PRP2_PAGE = 1 << 2;
        /// PRP2 = 2ページ目以降を列挙したPRPリスト
        const PRP2_LIST = 1 << 3;
    }
}

// ============================================================================
// Read-Only Region
// ============================================================================

/// 読み取り専用メモリ領域
///
/// ドライバが確保・解放するキューメモリを指す。デバイスが並行して
/// 書き込み得るため、内容の読み出しは常にコピーで行う。
/// リングから作った領域はリングへの参照を保持し、領域が使われている間
/// リングは解放されない。
#[derive(Clone)]
pub struct RoRegion {
    addr: usize,
    len: usize,
    source: RegionSource,
}

#[derive(Clone)]
enum RegionSource {
    /// 呼び出し側が寿命を保証する生ポインタ
    Raw(NonNull<u8>),
    /// 保持しているリング越しに読む
    Ring(Arc<dyn RingMemory>),
}

// Safety: Raw はこのクレートから書き込まれることがなく、読み出しは
// volatileコピーのみ。Ring は RingMemory: Send + Sync
unsafe impl Send for RoRegion {}
unsafe impl Sync for RoRegion {}

impl RoRegion {
    /// 生ポインタから作成
    ///
    /// # Safety
    /// - `base` から `len` バイトが、この値（とそのクローン）が使われる間
    ///   読み取り可能であり続けること
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self {
            addr: base.as_ptr() as usize,
            len,
            source: RegionSource::Raw(base),
        }
    }

    /// `'static` スライスから作成
    pub fn from_static(slice: &'static [u8]) -> Self {
        Self {
            addr: slice.as_ptr() as usize,
            len: slice.len(),
            source: RegionSource::Raw(NonNull::from(slice).cast()),
        }
    }

    /// リング全体を参照する
    pub fn from_ring(ring: Arc<dyn RingMemory>) -> Self {
        Self {
            addr: ring.host_addr(),
            len: ring.entries() as usize * ring.entry_size(),
            source: RegionSource::Ring(ring),
        }
    }

    /// 先頭のホスト仮想アドレス
    pub fn host_addr(&self) -> usize {
        self.addr
    }

    /// バイト数
    pub fn len(&self) -> usize {
        self.len
    }

    /// 空か
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `offset` から `out` へ読み出し、読み出したバイト数を返す
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        let n = self.len.saturating_sub(offset).min(out.len());
        match &self.source {
            RegionSource::Raw(base) => {
                for (i, b) in out[..n].iter_mut().enumerate() {
                    // Safety: offset + i < len（from_raw_parts の契約）
                    *b = unsafe { core::ptr::read_volatile(base.as_ptr().add(offset + i)) };
                }
            }
            RegionSource::Ring(ring) => {
                let entry_size = ring.entry_size();
                let mut scratch = vec![0u8; entry_size];
                let mut done = 0;
                while done < n {
                    let pos = offset + done;
                    let within = pos % entry_size;
                    ring.read_entry((pos / entry_size) as u16, &mut scratch);
                    let take = (entry_size - within).min(n - done);
                    out[done..done + take].copy_from_slice(&scratch[within..within + take]);
                    done += take;
                }
            }
        }
        n
    }

    /// 内容をコピー
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_at(0, &mut out);
        out
    }
}

impl fmt::Debug for RoRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("ring", &matches!(self.source, RegionSource::Ring(_)))
            .finish()
    }
}

// ============================================================================
// Buffer State
// ============================================================================

/// コマンドに関連付けられたバッファ
#[derive(Clone)]
pub enum PrpBuffer {
    /// バッファなし
    None,
    /// テスト所有の読み書き可能バッファ
    ReadWrite(SharedMemBuffer),
    /// ドライバ所有メモリへの読み取り専用参照
    ReadOnly(RoRegion),
}

/// バッファの読み取り専用ビュー
#[derive(Clone, Copy)]
pub enum PrpView<'a> {
    /// バッファなし
    None,
    /// 読み書き可能バッファを読み取り専用で参照
    ReadWrite(&'a SharedMemBuffer),
    /// 読み取り専用領域
    ReadOnly(&'a RoRegion),
}

impl PrpView<'_> {
    /// バッファが無いか
    pub fn is_none(&self) -> bool {
        matches!(self, PrpView::None)
    }

    /// バイト数（バッファなしは0）
    pub fn len(&self) -> usize {
        match self {
            PrpView::None => 0,
            PrpView::ReadWrite(buf) => buf.len(),
            PrpView::ReadOnly(region) => region.len(),
        }
    }

    /// 空か
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `offset` から読み出し
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        match self {
            PrpView::None => 0,
            PrpView::ReadWrite(buf) => buf.read_at(offset, out),
            PrpView::ReadOnly(region) => region.read_at(offset, out),
        }
    }

    /// 内容をコピー（バッファなしは `None`）
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        match self {
            PrpView::None => None,
            PrpView::ReadWrite(buf) => Some(buf.to_vec()),
            PrpView::ReadOnly(region) => Some(region.to_vec()),
        }
    }
}

// ============================================================================
// PRP Data
// ============================================================================

/// コマンドのPRPディスクリプタ
#[derive(Clone)]
pub struct PrpData {
    /// 関連付けられたバッファ
    buffer: PrpBuffer,
    /// 実際に使用するPRPフィールド
    prp_fields: PrpBitmask,
    /// コマンド種別が許可するPRPフィールド（構築時に固定）
    prp_allowed: PrpBitmask,
}

impl PrpData {
    /// 許可マスクを固定して空のディスクリプタを作成
    pub const fn new(prp_allowed: PrpBitmask) -> Self {
        Self {
            buffer: PrpBuffer::None,
            prp_fields: PrpBitmask::empty(),
            prp_allowed,
        }
    }

    fn check_allowed(&self, fields: PrpBitmask) -> Result<()> {
        if !self.prp_allowed.contains(fields) {
            return Err(ConformanceError::IllegalLayout {
                requested: fields,
                allowed: self.prp_allowed,
            });
        }
        Ok(())
    }

    /// テスト所有の読み書き可能バッファを関連付け
    ///
    /// 許可されていない配置は `IllegalLayout` で拒否し、状態は変えない。
    pub fn set_prp_buffer(&mut self, fields: PrpBitmask, buffer: SharedMemBuffer) -> Result<()> {
        self.check_allowed(fields)?;
        log::debug!(
            "PRP: RW buffer {} bytes, fields {:#x}",
            buffer.len(),
            fields.bits()
        );
        self.buffer = PrpBuffer::ReadWrite(buffer);
        self.prp_fields = fields;
        Ok(())
    }

    /// ドライバ所有メモリへの読み取り専用参照を関連付け
    pub fn set_prp_buffer_ro(&mut self, fields: PrpBitmask, region: RoRegion) -> Result<()> {
        self.check_allowed(fields)?;
        log::debug!(
            "PRP: RO region {} bytes, fields {:#x}",
            region.len(),
            fields.bits()
        );
        self.buffer = PrpBuffer::ReadOnly(region);
        self.prp_fields = fields;
        Ok(())
    }

    /// 読み書き可能バッファ（RO参照やバッファなしの場合は `None`）
    pub fn rw_buffer(&self) -> Option<SharedMemBuffer> {
        match &self.buffer {
            PrpBuffer::ReadWrite(buf) => Some(buf.clone()),
            _ => None,
        }
    }

    /// 関連付けられたバッファの読み取り専用ビュー
    pub fn ro_buffer(&self) -> PrpView<'_> {
        match &self.buffer {
            PrpBuffer::None => PrpView::None,
            PrpBuffer::ReadWrite(buf) => PrpView::ReadWrite(buf),
            PrpBuffer::ReadOnly(region) => PrpView::ReadOnly(region),
        }
    }

    /// バッファのバイト数
    pub fn buffer_size(&self) -> usize {
        self.ro_buffer().len()
    }

    /// バッファ先頭のホスト仮想アドレス
    pub fn host_addr(&self) -> Option<usize> {
        match &self.buffer {
            PrpBuffer::None => None,
            PrpBuffer::ReadWrite(buf) => Some(buf.host_addr()),
            PrpBuffer::ReadOnly(region) => Some(region.host_addr()),
        }
    }

    /// 使用するPRPフィールド
    pub fn prp_bitmask(&self) -> PrpBitmask {
        self.prp_fields
    }

    /// 許可されたPRPフィールド
    pub fn prp_allowed(&self) -> PrpBitmask {
        self.prp_allowed
    }
}

// ============================================================================
// PRP Planning
// ============================================================================

/// PRPリストをどのフィールドが指すか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrpListField {
    Prp1,
    Prp2,
}

/// ワイヤに書くPRP値の計画
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrpPlan {
    /// PRP1（リストを指す場合は解決前0）
    pub prp1: u64,
    /// PRP2（リストを指す場合は解決前0）
    pub prp2: u64,
    /// PRPリストに書くエントリ
    pub list: Option<(PrpListField, Vec<u64>)>,
}

impl PrpPlan {
    /// リストのバスアドレスを埋めて (PRP1, PRP2) を返す
    pub fn resolve(&self, list_bus_addr: u64) -> (u64, u64) {
        match self.list {
            Some((PrpListField::Prp1, _)) => (list_bus_addr, self.prp2),
            Some((PrpListField::Prp2, _)) => (self.prp1, list_bus_addr),
            None => (self.prp1, self.prp2),
        }
    }
}

/// バッファが占めるページのアドレス列（先頭はオフセット付き）
pub fn page_addresses(base: u64, len: usize, page_size: usize) -> Vec<u64> {
    let page = page_size as u64;
    let end = base + len as u64;
    let mut pages = alloc::vec![base];
    let mut next = (base & !(page - 1)) + page;
    while next < end {
        pages.push(next);
        next += page;
    }
    pages
}

/// PRPビットマスクとバッファ位置からPRP値を計画
///
/// マスクが空の場合は何も書かない計画を返す（ポインタフィールドは
/// 呼び出し側が設定した値のまま残る）。
pub fn plan_prp(mask: PrpBitmask, base: u64, len: usize, page_size: usize) -> Result<PrpPlan> {
    if mask.is_empty() {
        return Ok(PrpPlan::default());
    }
    let undescribed = || ConformanceError::UndescribedBuffer { len, mask };
    let pages = page_addresses(base, len, page_size);

    if mask.contains(PrpBitmask::PRP1_LIST) {
        if pages.len() > PRP_ENTRIES_PER_PAGE {
            return Err(undescribed());
        }
        return Ok(PrpPlan {
            prp1: 0,
            prp2: 0,
            list: Some((PrpListField::Prp1, pages)),
        });
    }
    if !mask.contains(PrpBitmask::PRP1_PAGE) {
        return Err(undescribed());
    }

    let rest = &pages[1..];
    let mut plan = PrpPlan {
        prp1: pages[0],
        ..PrpPlan::default()
    };
    match rest.len() {
        0 => {}
        1 if mask.contains(PrpBitmask::PRP2_PAGE) => plan.prp2 = rest[0],
        n if n >= 2 && n <= PRP_ENTRIES_PER_PAGE && mask.contains(PrpBitmask::PRP2_LIST) => {
            plan.list = Some((PrpListField::Prp2, rest.to_vec()));
        }
        _ => return Err(undescribed()),
    }
    Ok(plan)
}

// ============================================================================
// PRP List Storage
// ============================================================================

/// PRPリスト（4KB超の転送用）
#[repr(C, align(4096))]
pub struct PrpList {
    /// PRPエントリ配列（最大512エントリ = 4096/8）
    entries: [u64; PRP_ENTRIES_PER_PAGE],
    /// 使用中エントリ数
    count: usize,
}

impl PrpList {
    /// 新しいPRPリストを作成
    pub fn new() -> Self {
        Self {
            entries: [0; PRP_ENTRIES_PER_PAGE],
            count: 0,
        }
    }

    /// 内容を置き換える（1ページに収まらない場合は `false`）
    pub fn load(&mut self, entries: &[u64]) -> bool {
        if entries.len() > PRP_ENTRIES_PER_PAGE {
            return false;
        }
        self.entries[..entries.len()].copy_from_slice(entries);
        self.entries[entries.len()..].fill(0);
        self.count = entries.len();
        true
    }

    /// 使用中のエントリ
    pub fn entries(&self) -> &[u64] {
        &self.entries[..self.count]
    }

    /// リスト先頭のホスト仮想アドレス
    pub fn host_addr(&self) -> usize {
        self.entries.as_ptr() as usize
    }
}

impl Default for PrpList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::defs::PAGE_SIZE;
    use crate::nvme::mem_buffer::MemBuffer;

    const ALLOWED: PrpBitmask = PrpBitmask::PRP1_PAGE.union(PrpBitmask::PRP2_PAGE);

    #[test]
    fn test_empty_descriptor() {
        let prp = PrpData::new(ALLOWED);
        assert!(prp.ro_buffer().is_none());
        assert!(prp.rw_buffer().is_none());
        assert_eq!(prp.buffer_size(), 0);
        assert!(prp.prp_bitmask().is_empty());
    }

    #[test]
    fn test_illegal_layout_is_rejected_idempotently() {
        let mut prp = PrpData::new(ALLOWED);
        let buf = MemBuffer::new(PAGE_SIZE);
        prp.set_prp_buffer(PrpBitmask::PRP1_PAGE, buf.clone()).unwrap();

        for bad in [
            PrpBitmask::PRP2_LIST,
            PrpBitmask::PRP1_LIST,
            PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_LIST,
        ] {
            let err = prp.set_prp_buffer(bad, MemBuffer::new(8)).unwrap_err();
            assert_eq!(
                err,
                ConformanceError::IllegalLayout {
                    requested: bad,
                    allowed: ALLOWED
                }
            );
            let region = RoRegion::from_static(&[0u8; 16]);
            assert!(prp.set_prp_buffer_ro(bad, region).is_err());
            assert_eq!(prp.prp_bitmask(), PrpBitmask::PRP1_PAGE);
            assert_eq!(prp.buffer_size(), PAGE_SIZE);
        }
        assert_eq!(prp.prp_allowed(), ALLOWED);
    }

    #[test]
    fn test_rw_and_ro_views() {
        let mut prp = PrpData::new(ALLOWED);
        let buf = MemBuffer::new(4);
        buf.write_at(0, &[9, 8, 7, 6]);
        prp.set_prp_buffer(PrpBitmask::PRP1_PAGE, buf).unwrap();
        assert!(prp.rw_buffer().is_some());
        assert_eq!(prp.ro_buffer().to_vec(), Some(alloc::vec![9, 8, 7, 6]));

        static QUEUE_MEM: [u8; 3] = [1, 2, 3];
        prp.set_prp_buffer_ro(PrpBitmask::PRP1_PAGE, RoRegion::from_static(&QUEUE_MEM))
            .unwrap();
        assert!(prp.rw_buffer().is_none());
        assert_eq!(prp.ro_buffer().to_vec(), Some(alloc::vec![1, 2, 3]));
        assert_eq!(prp.host_addr(), Some(QUEUE_MEM.as_ptr() as usize));
    }

    #[test]
    fn test_page_addresses_with_offset() {
        let pages = page_addresses(0x1_0200, 2 * PAGE_SIZE, PAGE_SIZE);
        assert_eq!(pages, alloc::vec![0x1_0200, 0x1_1000, 0x1_2000]);
        assert_eq!(page_addresses(0x2000, 0, PAGE_SIZE), alloc::vec![0x2000]);
        assert_eq!(page_addresses(0x2000, PAGE_SIZE, PAGE_SIZE), alloc::vec![0x2000]);
    }

    #[test]
    fn test_plan_single_and_two_pages() {
        let one = plan_prp(ALLOWED, 0x4000, 512, PAGE_SIZE).unwrap();
        assert_eq!((one.prp1, one.prp2, one.list.is_none()), (0x4000, 0, true));

        let two = plan_prp(ALLOWED, 0x4000, 2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!((two.prp1, two.prp2), (0x4000, 0x5000));
    }

    #[test]
    fn test_plan_prp2_list() {
        let mask = PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_LIST;
        let plan = plan_prp(mask, 0x8000, 3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(plan.prp1, 0x8000);
        assert_eq!(
            plan.list,
            Some((PrpListField::Prp2, alloc::vec![0x9000, 0xA000]))
        );
        assert_eq!(plan.resolve(0xF000), (0x8000, 0xF000));
    }

    #[test]
    fn test_plan_prp1_list() {
        let plan = plan_prp(PrpBitmask::PRP1_LIST, 0x8000, 2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(
            plan.list,
            Some((PrpListField::Prp1, alloc::vec![0x8000, 0x9000]))
        );
        assert_eq!(plan.resolve(0xF000), (0xF000, 0));
    }

    #[test]
    fn test_plan_rejects_undescribed_pages() {
        let err = plan_prp(PrpBitmask::PRP1_PAGE, 0x8000, 2 * PAGE_SIZE, PAGE_SIZE).unwrap_err();
        assert!(matches!(err, ConformanceError::UndescribedBuffer { .. }));
        assert!(plan_prp(ALLOWED, 0x8000, 3 * PAGE_SIZE, PAGE_SIZE).is_err());
        assert!(plan_prp(PrpBitmask::PRP2_PAGE, 0x8000, 16, PAGE_SIZE).is_err());
    }

    #[test]
    fn test_empty_mask_plans_nothing() {
        assert_eq!(
            plan_prp(PrpBitmask::empty(), 0x8000, 64, PAGE_SIZE).unwrap(),
            PrpPlan::default()
        );
    }

    #[test]
    fn test_prp_list_load() {
        let mut list = PrpList::new();
        assert!(list.load(&[1, 2, 3]));
        assert_eq!(list.entries(), &[1, 2, 3]);
        assert!(list.load(&[4]));
        assert_eq!(list.entries(), &[4]);
        assert!(!list.load(&[0; PRP_ENTRIES_PER_PAGE + 1]));
        assert_eq!(list.host_addr() % PAGE_SIZE, 0);
    }
}
