// ============================================================================
// src/nvme/cmds/features.rs - Get/Set Features Commands
// ============================================================================
//!
//! Get Features (0x0A) / Set Features (0x09)
//!
//! どちらもDW10 byte 0がFeature Identifier。Feature固有のパラメータは
//! DW11に入り、Get Featuresの結果は完了エントリのDW0で返る。

use crate::error::Result;
use crate::nvme::command::{Cmd, NvmeCmd};
use crate::nvme::defs::{AdminOpcode, cmd_layout};
use crate::nvme::prp::{DataDir, PrpBitmask};

const DW10: usize = cmd_layout::DW_CDW10;
const DW11: usize = cmd_layout::DW_CDW11;

/// Get Features SEL（DW10 byte 1 bits 2:0）
const SEL_MASK: u8 = 0x07;

/// Set Features SV（DW10 bit 31 = byte 3 bit 7）
const SAVE_MASK: u8 = 0x80;

/// Feature Select の値
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSelect {
    /// 現在値
    Current = 0,
    /// 既定値
    Default = 1,
    /// 保存値
    Saved = 2,
    /// サポート能力
    Capabilities = 3,
}

impl FeatureSelect {
    /// 生の値から変換
    pub fn from_raw(sel: u8) -> Option<Self> {
        match sel & SEL_MASK {
            0 => Some(FeatureSelect::Current),
            1 => Some(FeatureSelect::Default),
            2 => Some(FeatureSelect::Saved),
            3 => Some(FeatureSelect::Capabilities),
            _ => None,
        }
    }
}

// ============================================================================
// Get Features
// ============================================================================

/// Get Features コマンド
#[derive(Debug, Clone)]
pub struct GetFeatures {
    cmd: Cmd,
}

impl GetFeatures {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::GetFeatures as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(
                Self::OPCODE,
                DataDir::FromDevice,
                PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_PAGE,
            ),
        }
    }

    /// Feature Identifier を設定
    pub fn set_fid(&mut self, fid: u8) -> Result<()> {
        self.cmd.set_byte(fid, DW10, 0)
    }

    /// Feature Identifier
    pub fn fid(&self) -> Result<u8> {
        self.cmd.get_byte(DW10, 0)
    }

    /// SEL を設定（同じバイトの他のビットは保持）
    pub fn set_sel(&mut self, sel: u8) -> Result<()> {
        self.cmd.set_bits(sel, SEL_MASK, DW10, 1)
    }

    /// SEL
    pub fn sel(&self) -> Result<u8> {
        Ok(self.cmd.get_byte(DW10, 1)? & SEL_MASK)
    }

    /// Interrupt Vector Configuration の IV を設定
    pub fn set_int_vec_config_iv(&mut self, iv: u16) -> Result<()> {
        self.cmd.set_word(iv, DW11, 0)
    }

    /// Interrupt Vector Configuration の IV
    pub fn int_vec_config_iv(&self) -> Result<u16> {
        self.cmd.get_word(DW11, 0)
    }
}

impl Default for GetFeatures {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for GetFeatures {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "GetFeatures"
    }
}

// ============================================================================
// Set Features
// ============================================================================

/// Set Features コマンド
#[derive(Debug, Clone)]
pub struct SetFeatures {
    cmd: Cmd,
}

impl SetFeatures {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::SetFeatures as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(
                Self::OPCODE,
                DataDir::ToDevice,
                PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_PAGE,
            ),
        }
    }

    /// Feature Identifier を設定
    pub fn set_fid(&mut self, fid: u8) -> Result<()> {
        self.cmd.set_byte(fid, DW10, 0)
    }

    /// Feature Identifier
    pub fn fid(&self) -> Result<u8> {
        self.cmd.get_byte(DW10, 0)
    }

    /// SV（保存）ビット
    pub fn set_save(&mut self, save: bool) -> Result<()> {
        self.cmd.set_bits(if save { SAVE_MASK } else { 0 }, SAVE_MASK, DW10, 3)
    }

    /// SV（保存）ビット
    pub fn save(&self) -> Result<bool> {
        Ok(self.cmd.get_byte(DW10, 3)? & SAVE_MASK != 0)
    }

    /// Arbitration (FID 0x01): AB / LPW / MPW / HPW
    pub fn set_arbitration(&mut self, ab: u8, lpw: u8, mpw: u8, hpw: u8) -> Result<()> {
        self.cmd.set_bits(ab, 0x07, DW11, 0)?;
        self.cmd.set_byte(lpw, DW11, 1)?;
        self.cmd.set_byte(mpw, DW11, 2)?;
        self.cmd.set_byte(hpw, DW11, 3)
    }

    /// Temperature Threshold (FID 0x04): TMPTH（ケルビン）
    pub fn set_temp_threshold_tmpth(&mut self, tmpth: u16) -> Result<()> {
        self.cmd.set_word(tmpth, DW11, 0)
    }

    /// Temperature Threshold: TMPTH
    pub fn temp_threshold_tmpth(&self) -> Result<u16> {
        self.cmd.get_word(DW11, 0)
    }

    /// Temperature Threshold: TMPSEL（DW11 bits 19:16）
    pub fn set_temp_threshold_tmpsel(&mut self, tmpsel: u8) -> Result<()> {
        self.cmd.set_bits(tmpsel, 0x0F, DW11, 2)
    }

    /// Temperature Threshold: THSEL（DW11 bits 21:20）
    pub fn set_temp_threshold_thsel(&mut self, thsel: u8) -> Result<()> {
        self.cmd.set_bits(thsel << 4, 0x30, DW11, 2)
    }

    /// Error Recovery (FID 0x05): TLER（100ms単位）
    pub fn set_error_recovery_tler(&mut self, tler: u16) -> Result<()> {
        self.cmd.set_word(tler, DW11, 0)
    }

    /// Volatile Write Cache (FID 0x06): WCE
    pub fn set_volatile_write_cache(&mut self, enable: bool) -> Result<()> {
        self.cmd.set_bits(enable as u8, 0x01, DW11, 0)
    }

    /// Number of Queues (FID 0x07): NSQR / NCQR（0始まり）
    pub fn set_num_queues(&mut self, nsqr: u16, ncqr: u16) -> Result<()> {
        self.cmd.set_word(nsqr, DW11, 0)?;
        self.cmd.set_word(ncqr, DW11, 2)
    }

    /// Interrupt Coalescing (FID 0x08): THR / TIME
    pub fn set_irq_coalescing(&mut self, thr: u8, time: u8) -> Result<()> {
        self.cmd.set_byte(thr, DW11, 0)?;
        self.cmd.set_byte(time, DW11, 1)
    }

    /// Interrupt Vector Configuration (FID 0x09): IV / CD
    pub fn set_int_vec_config(&mut self, iv: u16, coalescing_disable: bool) -> Result<()> {
        self.cmd.set_word(iv, DW11, 0)?;
        self.cmd.set_bits(coalescing_disable as u8, 0x01, DW11, 2)
    }

    /// Asynchronous Event Configuration (FID 0x0B): クリティカル警告マスク
    pub fn set_async_event_config(&mut self, critical_warnings: u8) -> Result<()> {
        self.cmd.set_byte(critical_warnings, DW11, 0)
    }
}

impl Default for SetFeatures {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for SetFeatures {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "SetFeatures"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConformanceError;
    use crate::nvme::defs::feature_ids;
    use crate::nvme::mem_buffer::MemBuffer;

    #[test]
    fn test_get_features_capabilities() {
        let get = GetFeatures::new();
        assert_eq!(get.opcode(), 0x0A);
        assert_eq!(get.data_dir(), DataDir::FromDevice);
        assert_eq!(get.payload_size(), 64);
        assert_eq!(get.prp_allowed(), PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_PAGE);
    }

    #[test]
    fn test_get_features_fields() {
        let mut get = GetFeatures::new();
        get.set_fid(feature_ids::IRQ_CONFIG).unwrap();
        get.set_int_vec_config_iv(0x0003).unwrap();
        assert_eq!(get.cmd().get_dword(10).unwrap() & 0xFF, 0x09);
        assert_eq!(get.cmd().get_word(11, 0).unwrap(), 0x0003);
        assert_eq!(get.int_vec_config_iv().unwrap(), 0x0003);
    }

    #[test]
    fn test_sel_only_touches_low_bits() {
        let mut get = GetFeatures::new();
        get.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        get.cmd_mut().set_byte(0xA8, 10, 1).unwrap();
        get.set_sel(FeatureSelect::Saved as u8).unwrap();
        assert_eq!(get.cmd().get_byte(10, 1).unwrap(), 0xAA);
        assert_eq!(get.sel().unwrap(), 2);
        get.set_sel(0xFF).unwrap();
        assert_eq!(get.cmd().get_byte(10, 1).unwrap(), 0xAF);
        assert_eq!(get.fid().unwrap(), feature_ids::TEMP_THRESHOLD);
    }

    #[test]
    fn test_get_features_rejects_list_layouts() {
        let mut get = GetFeatures::new();
        let err = get
            .cmd_mut()
            .set_prp_buffer(PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_LIST, MemBuffer::new(64))
            .unwrap_err();
        assert!(matches!(err, ConformanceError::IllegalLayout { .. }));
        assert!(get.cmd().prp().ro_buffer().is_none());
    }

    #[test]
    fn test_set_features_temp_threshold_fields() {
        let mut set = SetFeatures::new();
        set.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        set.set_temp_threshold_tmpth(0x0157).unwrap();
        set.set_temp_threshold_tmpsel(0x3).unwrap();
        set.set_temp_threshold_thsel(0x1).unwrap();
        assert_eq!(set.cmd().get_dword(11).unwrap(), 0x0013_0157);
        assert_eq!(set.temp_threshold_tmpth().unwrap(), 0x0157);
        set.set_save(true).unwrap();
        assert_eq!(set.cmd().get_dword(10).unwrap(), 0x8000_0004);
        assert!(set.save().unwrap());
        set.set_save(false).unwrap();
        assert_eq!(set.cmd().get_dword(10).unwrap(), 0x0000_0004);
    }

    #[test]
    fn test_set_features_dw11_layouts() {
        let mut set = SetFeatures::new();
        set.set_num_queues(7, 3).unwrap();
        assert_eq!(set.cmd().get_dword(11).unwrap(), 0x0003_0007);

        let mut set = SetFeatures::new();
        set.set_arbitration(0x0F, 0x11, 0x22, 0x33).unwrap();
        assert_eq!(set.cmd().get_dword(11).unwrap(), 0x3322_1107);

        let mut set = SetFeatures::new();
        set.set_int_vec_config(5, true).unwrap();
        assert_eq!(set.cmd().get_dword(11).unwrap(), 0x0001_0005);

        let mut set = SetFeatures::new();
        set.set_irq_coalescing(4, 10).unwrap();
        assert_eq!(set.cmd().get_dword(11).unwrap(), 0x0000_0A04);
    }

    #[test]
    fn test_feature_select_from_raw() {
        assert_eq!(FeatureSelect::from_raw(3), Some(FeatureSelect::Capabilities));
        assert_eq!(FeatureSelect::from_raw(0x0B), Some(FeatureSelect::Capabilities));
        assert_eq!(FeatureSelect::from_raw(4), None);
    }
}
