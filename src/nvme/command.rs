// ============================================================================
// src/nvme/command.rs - NVMe Command Structures
// ============================================================================
//!
//! NVMeコマンド構造体定義
//!
//! Submission Queue Entry (SQE) の基底型 `Cmd` と、具体的なコマンドが
//! 実装する能力トレイト `NvmeCmd`。
//!
//! 適合試験では単一フィールドを狙って書き換えることが多いため、
//! フィールドはすべて (DWORD, バイトオフセット) 指定のプリミティブで
//! 一つずつ設定する。名前付きアクセサは各コマンド型がこの上に実装する。

use core::sync::atomic::{AtomicU16, Ordering};

use crate::error::Result;
use crate::nvme::defs::{CMD_DWORDS, RESERVED_CID, SQE_SIZE, cmd_layout};
use crate::nvme::field::FieldPacked;
use crate::nvme::mem_buffer::SharedMemBuffer;
use crate::nvme::prp::{DataDir, PrpBitmask, PrpData, RoRegion};

/// 次に割り当てるCID
static NEXT_CID: AtomicU16 = AtomicU16::new(0);

/// プロセス全体で一意なCIDを割り当てる（予約値0xFFFFは飛ばす）
fn alloc_cid() -> u16 {
    loop {
        let cid = NEXT_CID.fetch_add(1, Ordering::Relaxed);
        if cid != RESERVED_CID {
            return cid;
        }
    }
}

// ============================================================================
// NVMe Submission Queue Entry (Command)
// ============================================================================

/// NVMeコマンド（64バイトのワイヤ構造体 + PRPディスクリプタ）
///
/// `Clone` はCIDもそのままコピーする。複製を同時に投入すると
/// `DuplicateCommandId` になるため、必要なら `set_cid` で振り直すこと。
#[derive(Clone)]
pub struct Cmd {
    /// ワイヤ構造体
    fields: FieldPacked<CMD_DWORDS>,
    /// データ転送方向
    data_dir: DataDir,
    /// ワイヤ上のコマンドサイズ（バイト）
    payload_size: usize,
    /// PRPディスクリプタ
    prp: PrpData,
}

impl Cmd {
    /// オペコード・方向・許可PRPマスクを固定して新しいコマンドを作成
    ///
    /// CIDは自動で割り当てられる。
    pub fn new(opcode: u8, data_dir: DataDir, prp_allowed: PrpBitmask) -> Self {
        let mut dwords = [0u32; CMD_DWORDS];
        dwords[cmd_layout::DW_CDW0] = (opcode as u32) | ((alloc_cid() as u32) << 16);
        Self {
            fields: FieldPacked::from_dwords(dwords),
            data_dir,
            payload_size: SQE_SIZE,
            prp: PrpData::new(prp_allowed),
        }
    }

    // ========================================
    // CDW0 accessors
    // ========================================

    /// オペコードを取得
    pub fn opcode(&self) -> u8 {
        self.fields.dwords()[cmd_layout::DW_CDW0] as u8
    }

    /// コマンドIDを取得
    pub fn cid(&self) -> u16 {
        (self.fields.dwords()[cmd_layout::DW_CDW0] >> 16) as u16
    }

    /// コマンドIDを上書き（フォールトインジェクション用）
    pub fn set_cid(&mut self, cid: u16) -> &mut Self {
        let cdw0 = &mut self.fields.dwords_mut()[cmd_layout::DW_CDW0];
        *cdw0 = (*cdw0 & 0x0000_FFFF) | ((cid as u32) << 16);
        self
    }

    /// Namespace IDを取得
    pub fn nsid(&self) -> u32 {
        self.fields.dwords()[cmd_layout::DW_NSID]
    }

    /// Namespace IDを設定
    pub fn set_nsid(&mut self, nsid: u32) -> &mut Self {
        self.fields.dwords_mut()[cmd_layout::DW_NSID] = nsid;
        self
    }

    /// データ転送方向
    pub fn data_dir(&self) -> DataDir {
        self.data_dir
    }

    /// ワイヤ上のコマンドサイズ（バイト）
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// ワイヤ構造体
    pub fn fields(&self) -> &FieldPacked<CMD_DWORDS> {
        &self.fields
    }

    // ========================================
    // Field primitives
    // ========================================

    /// 1バイト書き込み
    pub fn set_byte(&mut self, value: u8, dword: usize, byte_offset: usize) -> Result<()> {
        #[cfg(feature = "verbose_logging")]
        log::trace!("CID {:#06x}: DW{}[{}] <- {:#04x}", self.cid(), dword, byte_offset, value);
        self.fields.set_byte(value, dword, byte_offset)
    }

    /// 1バイト読み取り
    pub fn get_byte(&self, dword: usize, byte_offset: usize) -> Result<u8> {
        self.fields.get_byte(dword, byte_offset)
    }

    /// 1バイト内の `mask` ビットのみを書き換える（読み出し・変更・書き戻し）
    pub fn set_bits(&mut self, value: u8, mask: u8, dword: usize, byte_offset: usize) -> Result<()> {
        let current = self.fields.get_byte(dword, byte_offset)?;
        self.set_byte((current & !mask) | (value & mask), dword, byte_offset)
    }

    /// 2バイト書き込み
    pub fn set_word(&mut self, value: u16, dword: usize, byte_offset: usize) -> Result<()> {
        #[cfg(feature = "verbose_logging")]
        log::trace!("CID {:#06x}: DW{}[{}] <- {:#06x}", self.cid(), dword, byte_offset, value);
        self.fields.set_word(value, dword, byte_offset)
    }

    /// 2バイト読み取り
    pub fn get_word(&self, dword: usize, byte_offset: usize) -> Result<u16> {
        self.fields.get_word(dword, byte_offset)
    }

    /// 4バイト書き込み
    pub fn set_dword(&mut self, value: u32, dword: usize) -> Result<()> {
        #[cfg(feature = "verbose_logging")]
        log::trace!("CID {:#06x}: DW{} <- {:#010x}", self.cid(), dword, value);
        self.fields.set_dword(value, dword)
    }

    /// 4バイト読み取り
    pub fn get_dword(&self, dword: usize) -> Result<u32> {
        self.fields.get_dword(dword)
    }

    // ========================================
    // PRP
    // ========================================

    /// PRPディスクリプタ
    pub fn prp(&self) -> &PrpData {
        &self.prp
    }

    /// 読み書き可能バッファを関連付け
    pub fn set_prp_buffer(&mut self, fields: PrpBitmask, buffer: SharedMemBuffer) -> Result<()> {
        self.prp.set_prp_buffer(fields, buffer)
    }

    /// 読み取り専用領域を関連付け（キュー作成コマンド専用）
    pub(crate) fn set_prp_buffer_ro(&mut self, fields: PrpBitmask, region: RoRegion) -> Result<()> {
        self.prp.set_prp_buffer_ro(fields, region)
    }
}

impl core::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cmd")
            .field("opcode", &self.opcode())
            .field("cid", &self.cid())
            .field("data_dir", &self.data_dir)
            .field("prp_fields", &self.prp.prp_bitmask())
            .field("fields", &self.fields)
            .finish()
    }
}

// ============================================================================
// Command Capability Trait
// ============================================================================

/// 具体的なコマンド型が実装する能力セット
///
/// キューペアとエグゼキュータはこのトレイト越しにのみコマンドを扱う。
pub trait NvmeCmd {
    /// 基底コマンド
    fn cmd(&self) -> &Cmd;

    /// 基底コマンド（可変）
    fn cmd_mut(&mut self) -> &mut Cmd;

    /// ログ用のコマンド名
    fn name(&self) -> &'static str {
        "Cmd"
    }

    /// オペコード
    fn opcode(&self) -> u8 {
        self.cmd().opcode()
    }

    /// データ転送方向
    fn data_dir(&self) -> DataDir {
        self.cmd().data_dir()
    }

    /// ワイヤ上のコマンドサイズ
    fn payload_size(&self) -> usize {
        self.cmd().payload_size()
    }

    /// 許可されたPRP配置
    fn prp_allowed(&self) -> PrpBitmask {
        self.cmd().prp().prp_allowed()
    }

    /// コマンドID
    fn cid(&self) -> u16 {
        self.cmd().cid()
    }
}

impl NvmeCmd for Cmd {
    fn cmd(&self) -> &Cmd {
        self
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        self
    }
}
