use std::fmt;

use crate::{
    ir::{BasicBlock, Constant, Insn, Op, RegSpec, RopMethod},
    types::Kind,
};

impl fmt::Display for RegSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            Kind::Int => 'I',
            Kind::Float => 'F',
            Kind::Long => 'J',
            Kind::Double => 'D',
            Kind::Object => 'L',
        };
        write!(f, "v{}:{}", self.reg, tag)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "#{v}"),
            Constant::Long(v) => write!(f, "#{v}L"),
            Constant::Float(bits) => write!(f, "#{}f", f32::from_bits(*bits)),
            Constant::Double(bits) => write!(f, "#{}d", f64::from_bits(*bits)),
            Constant::Null => f.write_str("null"),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::MoveParam { index } => write!(f, "move-param #{index}"),
            Op::Move => f.write_str("move"),
            Op::MoveResultPseudo => f.write_str("move-result-pseudo"),
            Op::MoveException => f.write_str("move-exception"),
            Op::Const(c) => write!(f, "const {c}"),
            Op::ConstString(s) => write!(f, "const-string {s:?}"),
            Op::ConstClass(ty) => write!(f, "const-class {ty}"),
            Op::Unary(op) => write!(f, "{op}"),
            Op::Binary(op) => write!(f, "{op}"),
            Op::Convert { from, to } => write!(f, "{from}-to-{to}"),
            Op::Narrow(ty) => write!(f, "int-to-{}", ty.java_name()),
            Op::Cmp(op) => write!(f, "{op}"),
            Op::If(cond) => write!(f, "if-{cond}"),
            Op::IfZ(cond) => write!(f, "if-{cond}z"),
            Op::Goto => f.write_str("goto"),
            Op::Return => f.write_str("return"),
            Op::Throw => f.write_str("throw"),
            Op::CheckCast(ty) => write!(f, "check-cast {ty}"),
            Op::InstanceOf(ty) => write!(f, "instance-of {ty}"),
            Op::NewInstance(ty) => write!(f, "new-instance {ty}"),
            Op::NewArray(ty) => write!(f, "new-array {ty}"),
            Op::ArrayLength => f.write_str("array-length"),
            Op::AGet(ty) => write!(f, "aget {ty}"),
            Op::APut(ty) => write!(f, "aput {ty}"),
            Op::IGet(field) => write!(f, "iget {field}"),
            Op::IPut(field) => write!(f, "iput {field}"),
            Op::SGet(field) => write!(f, "sget {field}"),
            Op::SPut(field) => write!(f, "sput {field}"),
            Op::Invoke(kind, method) => write!(f, "invoke-{kind} {method}"),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{result} <- ")?;
        }
        write!(f, "{}", self.op)?;
        for (i, source) in self.sources.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{source}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for insn in &self.insns {
            writeln!(f, "    {insn}")?;
        }
        if !self.successors.is_empty() {
            write!(f, "    ->")?;
            for succ in &self.successors {
                write!(f, " {succ}")?;
            }
            if let Some(primary) = self.primary {
                write!(f, " (primary {primary})")?;
            }
            writeln!(f)?;
        }
        for catch in &self.catches {
            match &catch.ty {
                Some(ty) => writeln!(f, "    catch {ty} -> {}", catch.handler)?,
                None => writeln!(f, "    catch-all -> {}", catch.handler)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for RopMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (regs={}, params={}, entry={})",
            self.name, self.reg_count, self.param_words, self.entry
        )?;
        for (idx, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  B{idx}:")?;
            write!(f, "{block}")?;
        }
        Ok(())
    }
}
