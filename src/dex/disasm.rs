//! Textual rendering of decoded units.
//!
//! Output resembles `dexdump`: one block per class, one line per instruction with its address,
//! and pool references resolved to descriptors. Branch operands are shown as absolute
//! targets.

use std::fmt::Write;

use crate::{
    dex::{
        insn::{decode_all, DalvInsn, Operand},
        opcode::IndexKind,
        ClassDefinition, CodeItem, Pool, Unit,
    },
    Result,
};

/// Renders one instruction at `address`, resolving indices against `pool`.
#[must_use]
pub fn render_insn(insn: &DalvInsn, address: u32, pool: &Pool) -> String {
    let mut line = String::new();
    let _ = write!(line, "{}", insn.opcode);
    let regs = insn
        .regs
        .iter()
        .map(|r| format!("v{r}"))
        .collect::<Vec<_>>();
    if insn.opcode.is_invoke() {
        let _ = write!(line, " {{{}}}", regs.join(", "));
    } else if !regs.is_empty() {
        let _ = write!(line, " {}", regs.join(", "));
    }
    let sep = if insn.regs.is_empty() && !insn.opcode.is_invoke() { " " } else { ", " };
    match insn.operand {
        Operand::None => {}
        Operand::Literal(value) => {
            let _ = write!(line, "{sep}#{value}");
        }
        Operand::Branch(offset) => {
            let target = i64::from(address) + i64::from(offset);
            let _ = write!(line, "{sep}{target:04x}");
        }
        Operand::Index(index) => {
            let i = index as usize;
            let resolved = match insn.opcode.index_kind() {
                Some(IndexKind::String) => pool.strings().get(i).map(|s| format!("{s:?}")),
                Some(IndexKind::Type) => pool.types().get(i).map(ToString::to_string),
                Some(IndexKind::Field) => pool.fields().get(i).map(ToString::to_string),
                Some(IndexKind::Method) => pool.methods().get(i).map(ToString::to_string),
                None => None,
            };
            match resolved {
                Some(text) => {
                    let _ = write!(line, "{sep}{text}");
                }
                None => {
                    let _ = write!(line, "{sep}@{index}");
                }
            }
        }
    }
    line
}

/// Renders a code item: frame sizes, instructions, try ranges and positions.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the instruction stream does not decode.
pub fn render_code(code: &CodeItem, pool: &Pool) -> Result<String> {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "      registers={} ins={} outs={} units={}",
        code.registers,
        code.ins,
        code.outs,
        code.insns.len()
    );
    for (address, insn) in decode_all(&code.insns)? {
        let _ = writeln!(out, "      {address:04x}: {}", render_insn(&insn, address, pool));
    }
    for item in &code.tries {
        let _ = write!(
            out,
            "      try {:04x}..{:04x}",
            item.start,
            item.start + u32::from(item.count)
        );
        if let Some(handler) = code.handlers.get(item.handler) {
            for &(ty, address) in &handler.catches {
                match pool.types().get(ty as usize) {
                    Some(ty) => {
                        let _ = write!(out, " {ty} -> {address:04x}");
                    }
                    None => {
                        let _ = write!(out, " type@{ty} -> {address:04x}");
                    }
                }
            }
            if let Some(address) = handler.catch_all {
                let _ = write!(out, " <any> -> {address:04x}");
            }
        }
        out.push('\n');
    }
    if let Some(debug) = &code.debug {
        let lines = debug
            .positions
            .iter()
            .map(|(address, line)| format!("{address:04x}:{line}"))
            .collect::<Vec<_>>();
        let _ = writeln!(out, "      lines {}", lines.join(" "));
    }
    Ok(out)
}

fn render_class(out: &mut String, class: &ClassDefinition, pool: &Pool) -> Result<()> {
    let name = |index: u32| {
        pool.types()
            .get(index as usize)
            .map_or_else(|| format!("type@{index}"), ToString::to_string)
    };
    let _ = write!(out, "class {} access={:#x}", name(class.class), class.access.bits());
    if let Some(superclass) = class.superclass {
        let _ = write!(out, " extends {}", name(superclass));
    }
    if !class.interfaces.is_empty() {
        let names = class.interfaces.iter().map(|&i| name(i)).collect::<Vec<_>>();
        let _ = write!(out, " implements {}", names.join(", "));
    }
    out.push('\n');

    for field in class.static_fields.iter().chain(&class.instance_fields) {
        if let Some(f) = pool.fields().get(field.field as usize) {
            let _ = writeln!(out, "  field {} access={:#x}", f, field.access.bits());
        }
    }
    for method in class.methods() {
        let Some(m) = pool.methods().get(method.method as usize) else {
            continue;
        };
        let _ = writeln!(out, "  method {} access={:#x}", m, method.access.bits());
        if let Some(code) = &method.code {
            out.push_str(&render_code(code, pool)?);
        }
    }
    Ok(())
}

/// Renders the table sizes and every class of a unit.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a code item does not decode.
pub fn render_unit(unit: &Unit) -> Result<String> {
    let pool = &unit.pool;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "strings={} types={} protos={} fields={} methods={} classes={}",
        pool.strings().len(),
        pool.types().len(),
        pool.protos().len(),
        pool.fields().len(),
        pool.methods().len(),
        unit.classes.len()
    );
    for class in &unit.classes {
        render_class(&mut out, class, pool)?;
    }
    Ok(out)
}
