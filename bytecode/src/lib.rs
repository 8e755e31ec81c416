mod op;
mod types;
mod instruction;
mod builder;
mod decoder;

pub use op::Op;
pub use types::{BasicType, parse_method_descriptor};
pub use instruction::Instruction;
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, decode_at};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).collect()
    }

    #[test]
    fn cache_indexed_instructions() {
        let mut b = BytecodeBuilder::new();
        b.ldc(1);
        b.get_static(2);
        b.put_field(0x1234);
        b.invoke(Op::InvokeVirtual, 7);
        b.invoke(Op::InvokeDynamic, 8);
        b.new_instance(9);
        b.multi_anew_array(10, 3);
        b.check_cast(11);
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::Ldc { idx: 1 },
            Instruction::GetStatic { idx: 2 },
            Instruction::PutField { idx: 0x1234 },
            Instruction::InvokeVirtual { idx: 7 },
            Instruction::InvokeDynamic { idx: 8 },
            Instruction::New { idx: 9 },
            Instruction::MultiANewArray { idx: 10, dims: 3 },
            Instruction::CheckCast { idx: 11 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn cache_index_is_little_endian() {
        let mut b = BytecodeBuilder::new();
        b.get_field(0x0102);
        assert_eq!(b.as_bytes(), &[Op::GetField as u8, 0x02, 0x01]);
    }

    #[test]
    fn forward_jump() {
        let mut b = BytecodeBuilder::new();
        let label = b.if_zero();
        b.nop();
        b.nop();
        b.bind(label);
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::IfZero { offset: 2 },
            Instruction::Nop,
            Instruction::Nop,
            Instruction::Return,
        ]);
    }

    #[test]
    fn backward_jump() {
        let mut b = BytecodeBuilder::new();
        let loop_top = b.current_offset();
        b.get_static(0);
        b.goto_back(loop_top);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::GetStatic { idx: 0 },
            Instruction::Goto { offset: -6 },
        ]);
    }

    #[test]
    fn decode_at_reports_next_bci() {
        let mut b = BytecodeBuilder::new();
        b.monitor_enter();
        b.multi_anew_array(4, 2);
        b.monitor_exit();
        let bytes = b.into_bytes();

        assert_eq!(
            decode_at(&bytes, 1),
            Some((Instruction::MultiANewArray { idx: 4, dims: 2 }, 5))
        );
        assert_eq!(decode_at(&bytes, 5), Some((Instruction::MonitorExit, 6)));
        assert_eq!(decode_at(&bytes, 6), None);
    }

    #[test]
    fn truncated_and_unknown_input() {
        assert_eq!(decode_at(&[Op::GetField as u8, 0x01], 0), None);
        assert_eq!(decode_at(&[0xFF], 0), None);
        // 3 is not a BasicType code
        assert_eq!(decode_at(&[Op::NewArray as u8, 3], 0), None);
    }

    #[test]
    fn op_lengths_match_builder() {
        let mut b = BytecodeBuilder::new();
        b.new_array(BasicType::Int);
        assert_eq!(b.as_bytes().len(), Op::NewArray.length());
        let mut b = BytecodeBuilder::new();
        b.ret(3);
        assert_eq!(b.as_bytes().len(), Op::Ret.length());
        assert_eq!(Op::Throw.length(), 1);
    }

    #[test]
    fn op_classification() {
        assert!(Op::PutStatic.is_field_access());
        assert!(Op::InvokeHandle.is_invoke());
        assert!(!Op::New.is_invoke());
        assert!(Op::Jsr.is_branch());
        assert!(!Op::Goto.is_conditional());
        assert!(Op::IfNonZero.is_conditional());
        assert!(Op::MultiANewArray.has_cache_index());
        assert!(!Op::NewArray.has_cache_index());
        assert_eq!(Op::try_from(Op::Throw as u8 + 1), Err(Op::COUNT as u8));
    }

    #[test]
    fn display_instructions() {
        assert_eq!(Instruction::GetField { idx: 5 }.to_string(), "GetField #5");
        assert_eq!(Instruction::Goto { offset: -7 }.to_string(), "Goto -7");
        assert_eq!(
            Instruction::NewArray { elem: BasicType::Long }.to_string(),
            "NewArray long"
        );
        assert_eq!(Instruction::Ret { local: 2 }.to_string(), "Ret l2");
    }

    #[test]
    fn method_descriptors() {
        let (params, ret) =
            parse_method_descriptor("(IJLjava/lang/String;[[DZ)V").unwrap();
        assert_eq!(params, vec![
            BasicType::Int,
            BasicType::Long,
            BasicType::Object,
            BasicType::Array,
            BasicType::Boolean,
        ]);
        assert_eq!(ret, BasicType::Void);

        assert_eq!(
            parse_method_descriptor("()[Ljava/lang/Object;"),
            Some((vec![], BasicType::Array))
        );
        assert_eq!(parse_method_descriptor("(I"), None);
        assert_eq!(parse_method_descriptor("(Q)V"), None);
        assert_eq!(parse_method_descriptor("()VV"), None);
    }

    #[test]
    fn basic_type_slots() {
        assert_eq!(BasicType::Long.slots(), 2);
        assert_eq!(BasicType::Double.slots(), 2);
        assert_eq!(BasicType::Object.slots(), 1);
        assert_eq!(BasicType::Void.slots(), 0);
        assert!(BasicType::Short.is_subword());
        assert!(!BasicType::Int.is_subword());
    }
}
