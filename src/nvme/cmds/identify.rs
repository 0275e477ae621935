// ============================================================================
// src/nvme/cmds/identify.rs - Identify Command
// ============================================================================
//!
//! Identify (0x06)

use crate::error::Result;
use crate::nvme::command::{Cmd, NvmeCmd};
use crate::nvme::defs::{AdminOpcode, cmd_layout};
use crate::nvme::mem_buffer::{MemBuffer, SharedMemBuffer};
use crate::nvme::prp::{DataDir, PrpBitmask};

/// Identifyデータ構造のサイズ
pub const IDENTIFY_DATA_SIZE: usize = 4096;

/// CNS値
pub mod cns {
    /// Identify Namespace
    pub const NAMESPACE: u8 = 0x00;
    /// Identify Controller
    pub const CONTROLLER: u8 = 0x01;
    /// Active Namespace ID list
    pub const ACTIVE_NS_LIST: u8 = 0x02;
}

/// Identify コマンド
#[derive(Debug, Clone)]
pub struct Identify {
    cmd: Cmd,
}

impl Identify {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::Identify as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(
                Self::OPCODE,
                DataDir::FromDevice,
                PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_PAGE,
            ),
        }
    }

    /// CNS を設定
    pub fn set_cns(&mut self, cns: u8) -> Result<()> {
        self.cmd.set_byte(cns, cmd_layout::DW_CDW10, 0)
    }

    /// CNS
    pub fn cns(&self) -> Result<u8> {
        self.cmd.get_byte(cmd_layout::DW_CDW10, 0)
    }

    /// Namespace ID を設定
    pub fn set_nsid(&mut self, nsid: u32) -> Result<()> {
        self.cmd.set_dword(nsid, cmd_layout::DW_NSID)
    }

    /// Identifyデータ1ページ分のバッファを確保してPRP1で関連付ける
    pub fn attach_data_buffer(&mut self) -> Result<SharedMemBuffer> {
        let buf = MemBuffer::new(IDENTIFY_DATA_SIZE);
        self.cmd.set_prp_buffer(PrpBitmask::PRP1_PAGE, buf.clone())?;
        Ok(buf)
    }
}

impl Default for Identify {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for Identify {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "Identify"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_controller_fields() {
        let mut id = Identify::new();
        id.set_cns(cns::CONTROLLER).unwrap();
        id.set_nsid(0).unwrap();
        assert_eq!(id.opcode(), 0x06);
        assert_eq!(id.cns().unwrap(), 0x01);
        assert_eq!(id.cmd().get_dword(10).unwrap(), 0x01);
    }

    #[test]
    fn test_identify_namespace_fields() {
        let mut id = Identify::new();
        id.set_cns(cns::NAMESPACE).unwrap();
        id.set_nsid(1).unwrap();
        assert_eq!(id.cmd().nsid(), 1);
    }

    #[test]
    fn test_data_buffer_is_one_page() {
        let mut id = Identify::new();
        let buf = id.attach_data_buffer().unwrap();
        assert_eq!(buf.len(), IDENTIFY_DATA_SIZE);
        assert_eq!(buf.first_page_offset(), 0);
        assert_eq!(id.cmd().prp().prp_bitmask(), PrpBitmask::PRP1_PAGE);
        assert_eq!(id.cmd().prp().buffer_size(), IDENTIFY_DATA_SIZE);
    }
}
