// ============================================================================
// src/nvme/cmds/mod.rs - Admin Command Variants
// ============================================================================
//!
//! 具体的なAdminコマンドと、それらをまとめるタグ付き列挙型 `AdminCmd`

pub mod features;
pub mod identify;
pub mod queues;

pub use features::{FeatureSelect, GetFeatures, SetFeatures};
pub use identify::Identify;
pub use queues::{CreateIoCq, CreateIoSq, DeleteIoCq, DeleteIoSq, QueuePriority};

use crate::nvme::command::{Cmd, NvmeCmd};

/// Adminコマンドのレジストリ
#[derive(Debug, Clone)]
pub enum AdminCmd {
    GetFeatures(GetFeatures),
    SetFeatures(SetFeatures),
    Identify(Identify),
    CreateIoCq(CreateIoCq),
    CreateIoSq(CreateIoSq),
    DeleteIoCq(DeleteIoCq),
    DeleteIoSq(DeleteIoSq),
}

impl AdminCmd {
    /// オペコードから空のコマンドを作成
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            GetFeatures::OPCODE => AdminCmd::GetFeatures(GetFeatures::new()),
            SetFeatures::OPCODE => AdminCmd::SetFeatures(SetFeatures::new()),
            Identify::OPCODE => AdminCmd::Identify(Identify::new()),
            CreateIoCq::OPCODE => AdminCmd::CreateIoCq(CreateIoCq::new()),
            CreateIoSq::OPCODE => AdminCmd::CreateIoSq(CreateIoSq::new()),
            DeleteIoCq::OPCODE => AdminCmd::DeleteIoCq(DeleteIoCq::new()),
            DeleteIoSq::OPCODE => AdminCmd::DeleteIoSq(DeleteIoSq::new()),
            _ => return None,
        })
    }

    fn inner(&self) -> &dyn NvmeCmd {
        match self {
            AdminCmd::GetFeatures(c) => c,
            AdminCmd::SetFeatures(c) => c,
            AdminCmd::Identify(c) => c,
            AdminCmd::CreateIoCq(c) => c,
            AdminCmd::CreateIoSq(c) => c,
            AdminCmd::DeleteIoCq(c) => c,
            AdminCmd::DeleteIoSq(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn NvmeCmd {
        match self {
            AdminCmd::GetFeatures(c) => c,
            AdminCmd::SetFeatures(c) => c,
            AdminCmd::Identify(c) => c,
            AdminCmd::CreateIoCq(c) => c,
            AdminCmd::CreateIoSq(c) => c,
            AdminCmd::DeleteIoCq(c) => c,
            AdminCmd::DeleteIoSq(c) => c,
        }
    }
}

impl NvmeCmd for AdminCmd {
    fn cmd(&self) -> &Cmd {
        self.inner().cmd()
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        self.inner_mut().cmd_mut()
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::prp::{DataDir, PrpBitmask};

    #[test]
    fn test_registry_covers_known_opcodes() {
        for (op, name) in [
            (0x0A, "GetFeatures"),
            (0x09, "SetFeatures"),
            (0x06, "Identify"),
            (0x05, "CreateIoCq"),
            (0x01, "CreateIoSq"),
            (0x04, "DeleteIoCq"),
            (0x00, "DeleteIoSq"),
        ] {
            let cmd = AdminCmd::from_opcode(op).unwrap();
            assert_eq!(cmd.opcode(), op);
            assert_eq!(cmd.name(), name);
        }
        assert!(AdminCmd::from_opcode(0x7F).is_none());
    }

    #[test]
    fn test_registry_delegates_capabilities() {
        let mut cmd = AdminCmd::from_opcode(0x0A).unwrap();
        assert_eq!(cmd.data_dir(), DataDir::FromDevice);
        assert_eq!(cmd.prp_allowed(), PrpBitmask::PRP1_PAGE | PrpBitmask::PRP2_PAGE);
        cmd.cmd_mut().set_byte(0x04, 10, 0).unwrap();
        match &cmd {
            AdminCmd::GetFeatures(get) => assert_eq!(get.fid().unwrap(), 0x04),
            _ => panic!("unexpected variant"),
        }
    }
}
