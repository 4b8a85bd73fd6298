//! Serialization of a [`Unit`] into a container.
//!
//! The writer works in two passes. The first lays out the data section in a scratch buffer,
//! recording the absolute offset of every item as it goes: the id sections have fixed sizes,
//! so the start of the data section is known before any item is written. The second pass
//! writes the header and the id sections, which point into the data, and appends the data
//! buffer. The signature and the checksum are computed last, in that order, because the
//! checksum covers the signature.
//!
//! Data section order:
//!
//! | Section      | Alignment | Notes                                          |
//! |--------------|-----------|------------------------------------------------|
//! | type lists   | 4         | deduplicated, in order of first use            |
//! | code items   | 4         | debug offsets patched once debug info is laid out |
//! | string data  | 1         | in string table order                          |
//! | debug info   | 1         |                                                |
//! | class data   | 1         | one per class with members                     |
//! | map list     | 4         |                                                |
//!
//! The output depends only on the unit, so writing the same unit twice is byte-identical.

use log::debug;
use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::{
    dex::{
        ClassDefinition, CodeItem, EncodedField, EncodedMethod, Unit, ENDIAN_TAG, HEADER_SIZE,
        MAGIC, NO_INDEX,
    },
    file::{io::write_le_at, mutf8, ByteSink},
    utils::adler32,
    Result,
};

/// Map list item types.
pub(crate) mod map {
    pub const HEADER: u16 = 0x0000;
    pub const STRING_ID: u16 = 0x0001;
    pub const TYPE_ID: u16 = 0x0002;
    pub const PROTO_ID: u16 = 0x0003;
    pub const FIELD_ID: u16 = 0x0004;
    pub const METHOD_ID: u16 = 0x0005;
    pub const CLASS_DEF: u16 = 0x0006;
    pub const MAP_LIST: u16 = 0x1000;
    pub const TYPE_LIST: u16 = 0x1001;
    pub const CLASS_DATA: u16 = 0x2000;
    pub const CODE_ITEM: u16 = 0x2001;
    pub const STRING_DATA: u16 = 0x2002;
    pub const DEBUG_INFO: u16 = 0x2003;
}

const STRING_ID_SIZE: usize = 4;
const TYPE_ID_SIZE: usize = 4;
const PROTO_ID_SIZE: usize = 12;
const FIELD_ID_SIZE: usize = 8;
const METHOD_ID_SIZE: usize = 8;
const CLASS_DEF_SIZE: usize = 32;

/// Offsets of the id sections, all known up front.
struct IdLayout {
    strings: usize,
    types: usize,
    protos: usize,
    fields: usize,
    methods: usize,
    classes: usize,
    data: usize,
}

impl IdLayout {
    fn new(unit: &Unit) -> Self {
        let pool = &unit.pool;
        let strings = HEADER_SIZE as usize;
        let types = strings + pool.strings().len() * STRING_ID_SIZE;
        let protos = types + pool.types().len() * TYPE_ID_SIZE;
        let fields = protos + pool.protos().len() * PROTO_ID_SIZE;
        let methods = fields + pool.fields().len() * FIELD_ID_SIZE;
        let classes = methods + pool.methods().len() * METHOD_ID_SIZE;
        let data = classes + unit.classes.len() * CLASS_DEF_SIZE;
        IdLayout {
            strings,
            types,
            protos,
            fields,
            methods,
            classes,
            data,
        }
    }
}

/// The data section under construction, with the offsets of everything placed so far.
struct DataSection {
    base: usize,
    bytes: Vec<u8>,
    type_lists: FxHashMap<Vec<u32>, u32>,
    type_list_count: u32,
    /// Offset of each proto's parameter list.
    proto_params: Vec<u32>,
    /// Offset of each class's interface list.
    interfaces: Vec<u32>,
    /// Code item offsets, per class, per method in class data order.
    code: Vec<Vec<u32>>,
    code_count: u32,
    strings: Vec<u32>,
    debug_count: u32,
    class_data: Vec<u32>,
    class_data_count: u32,
    /// Start offset of each section in the data, for the map.
    sections: Vec<(u16, u32, u32)>,
}

impl DataSection {
    fn offset(&self) -> Result<u32> {
        u32::try_from(self.base + self.bytes.len())
            .map_err(|_| encoding_error!("unit exceeds 4 GiB"))
    }

    fn align(&mut self) {
        // The data section starts on a 4-byte boundary, so relative alignment suffices.
        self.bytes.align_to(4);
    }

    fn type_list(&mut self, list: &[u32]) -> Result<u32> {
        if list.is_empty() {
            return Ok(0);
        }
        if let Some(&offset) = self.type_lists.get(list) {
            return Ok(offset);
        }
        self.align();
        let offset = self.offset()?;
        self.bytes.write_le(list.len() as u32);
        for &ty in list {
            self.bytes.write_le(narrow(ty, "type list entry")?);
        }
        self.type_lists.insert(list.to_vec(), offset);
        self.type_list_count += 1;
        Ok(offset)
    }
}

/// Writes `unit` as a `dex\n035\0` container.
///
/// # Errors
/// Returns [`crate::Error::Encoding`] if an index does not fit its field or the unit references
/// pool entries that do not exist.
pub fn write(unit: &Unit) -> Result<Vec<u8>> {
    let ids = IdLayout::new(unit);
    let data = lay_out_data(unit, ids.data)?;
    let map_off = data.sections.last().map_or(0, |&(_, _, offset)| offset);

    let mut out = Vec::with_capacity(data.base + data.bytes.len());
    write_header_placeholder(&mut out);
    write_ids(&mut out, unit, &ids, &data)?;
    if out.len() != ids.data {
        return Err(encoding_error!(
            "id sections end at {:#x}, expected {:#x}",
            out.len(),
            ids.data
        ));
    }
    out.extend_from_slice(&data.bytes);

    let file_size = u32::try_from(out.len()).map_err(|_| encoding_error!("unit exceeds 4 GiB"))?;
    let pool = &unit.pool;
    let mut header = Vec::with_capacity(HEADER_SIZE as usize - 32);
    header.write_le(file_size);
    header.write_le(HEADER_SIZE);
    header.write_le(ENDIAN_TAG);
    header.write_le(0u32);
    header.write_le(0u32);
    header.write_le(map_off);
    for (count, offset) in [
        (pool.strings().len(), ids.strings),
        (pool.types().len(), ids.types),
        (pool.protos().len(), ids.protos),
        (pool.fields().len(), ids.fields),
        (pool.methods().len(), ids.methods),
        (unit.classes.len(), ids.classes),
    ] {
        header.write_le(count as u32);
        header.write_le(if count == 0 { 0 } else { offset as u32 });
    }
    header.write_le((out.len() - ids.data) as u32);
    header.write_le(ids.data as u32);
    out[32..HEADER_SIZE as usize].copy_from_slice(&header);

    let signature = Sha1::digest(&out[32..]);
    out[12..32].copy_from_slice(&signature);
    let checksum = adler32(&out[12..]);
    write_le_at(&mut out, 8, checksum)?;

    debug!(
        "wrote unit: {} bytes, {} strings, {} methods, {} classes",
        file_size,
        pool.strings().len(),
        pool.methods().len(),
        unit.classes.len()
    );
    Ok(out)
}

fn write_header_placeholder(out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC);
    out.resize(HEADER_SIZE as usize, 0);
}

fn narrow(value: u32, what: &str) -> Result<u16> {
    u16::try_from(value).map_err(|_| encoding_error!("{} index {} exceeds 16 bits", what, value))
}

fn write_ids(out: &mut Vec<u8>, unit: &Unit, ids: &IdLayout, data: &DataSection) -> Result<()> {
    let pool = &unit.pool;

    for &offset in &data.strings {
        out.write_le(offset);
    }
    for ty in pool.types() {
        out.write_le(pool.string(ty.descriptor())?);
    }
    debug_assert_eq!(out.len(), ids.protos);
    for (proto, &params) in pool.protos().iter().zip(&data.proto_params) {
        out.write_le(pool.string(&proto.shorty())?);
        out.write_le(pool.type_id(&proto.ret)?);
        out.write_le(params);
    }
    for field in pool.fields() {
        out.write_le(narrow(pool.type_id(&field.owner)?, "field class")?);
        out.write_le(narrow(pool.type_id(&field.ty)?, "field type")?);
        out.write_le(pool.string(&field.name)?);
    }
    for method in pool.methods() {
        out.write_le(narrow(pool.type_id(&method.owner)?, "method class")?);
        out.write_le(narrow(pool.proto(&method.proto)?, "method prototype")?);
        out.write_le(pool.string(&method.name)?);
    }
    for (i, class) in unit.classes.iter().enumerate() {
        out.write_le(class.class);
        out.write_le(class.access.bits());
        out.write_le(class.superclass.unwrap_or(NO_INDEX));
        out.write_le(data.interfaces[i]);
        out.write_le(class.source_file.unwrap_or(NO_INDEX));
        // annotations_off
        out.write_le(0u32);
        out.write_le(data.class_data[i]);
        // static_values_off
        out.write_le(0u32);
    }
    Ok(())
}

fn lay_out_data(unit: &Unit, base: usize) -> Result<DataSection> {
    let pool = &unit.pool;
    let mut data = DataSection {
        base,
        bytes: Vec::new(),
        type_lists: FxHashMap::default(),
        type_list_count: 0,
        proto_params: Vec::with_capacity(pool.protos().len()),
        interfaces: Vec::with_capacity(unit.classes.len()),
        code: Vec::with_capacity(unit.classes.len()),
        code_count: 0,
        strings: Vec::with_capacity(pool.strings().len()),
        debug_count: 0,
        class_data: Vec::with_capacity(unit.classes.len()),
        class_data_count: 0,
        sections: Vec::new(),
    };

    // Type lists.
    let start = data.offset()?;
    for proto in pool.protos() {
        let params = proto
            .params
            .iter()
            .map(|ty| pool.type_id(ty))
            .collect::<Result<Vec<_>>>()?;
        let offset = data.type_list(&params)?;
        data.proto_params.push(offset);
    }
    for class in &unit.classes {
        let offset = data.type_list(&class.interfaces)?;
        data.interfaces.push(offset);
    }
    if data.type_list_count > 0 {
        data.sections.push((map::TYPE_LIST, data.type_list_count, start));
    }

    // Code items; the debug offset field of each is patched below.
    let mut debug_slots = Vec::new();
    let mut code_start = None;
    for class in &unit.classes {
        let mut offsets = Vec::new();
        for method in class.methods() {
            let Some(code) = &method.code else {
                offsets.push(0);
                continue;
            };
            data.align();
            let offset = data.offset()?;
            code_start.get_or_insert(offset);
            let slot = write_code(&mut data.bytes, code)?;
            if let Some(debug) = &code.debug {
                debug_slots.push((slot, debug));
            }
            offsets.push(offset);
            data.code_count += 1;
        }
        data.code.push(offsets);
    }
    if let Some(start) = code_start {
        data.sections.push((map::CODE_ITEM, data.code_count, start));
    }

    // String data.
    let start = data.offset()?;
    for value in pool.strings() {
        data.strings.push(data.offset()?);
        data.bytes.write_uleb128(mutf8::utf16_len(value) as u32);
        data.bytes.extend_from_slice(&mutf8::encode(value));
        data.bytes.push(0);
    }
    if !pool.strings().is_empty() {
        data.sections.push((map::STRING_DATA, pool.strings().len() as u32, start));
    }

    // Debug info.
    let start = data.offset()?;
    for (slot, debug) in debug_slots {
        let offset = data.offset()?;
        debug.encode(&mut data.bytes);
        write_le_at(&mut data.bytes, slot, offset)?;
        data.debug_count += 1;
    }
    if data.debug_count > 0 {
        data.sections.push((map::DEBUG_INFO, data.debug_count, start));
    }

    // Class data.
    let start = data.offset()?;
    for (class, code) in unit.classes.iter().zip(std::mem::take(&mut data.code)) {
        if class.has_no_data() {
            data.class_data.push(0);
            continue;
        }
        data.class_data.push(data.offset()?);
        write_class_data(&mut data.bytes, class, &code)?;
        data.class_data_count += 1;
    }
    if data.class_data_count > 0 {
        data.sections.push((map::CLASS_DATA, data.class_data_count, start));
    }

    // Map list.
    data.align();
    let map_off = data.offset()?;
    let mut entries: Vec<(u16, u32, u32)> = vec![(map::HEADER, 1, 0)];
    let ids = IdLayout::new(unit);
    for (kind, count, offset) in [
        (map::STRING_ID, pool.strings().len(), ids.strings),
        (map::TYPE_ID, pool.types().len(), ids.types),
        (map::PROTO_ID, pool.protos().len(), ids.protos),
        (map::FIELD_ID, pool.fields().len(), ids.fields),
        (map::METHOD_ID, pool.methods().len(), ids.methods),
        (map::CLASS_DEF, unit.classes.len(), ids.classes),
    ] {
        if count > 0 {
            entries.push((kind, count as u32, offset as u32));
        }
    }
    entries.append(&mut data.sections);
    entries.push((map::MAP_LIST, 1, map_off));

    data.bytes.write_le(entries.len() as u32);
    for &(kind, size, offset) in &entries {
        data.bytes.write_le(kind);
        data.bytes.write_le(0u16);
        data.bytes.write_le(size);
        data.bytes.write_le(offset);
    }
    data.sections = entries;
    Ok(data)
}

/// Writes a code item and returns the position of its debug offset field in `out`.
fn write_code(out: &mut Vec<u8>, code: &CodeItem) -> Result<usize> {
    let tries = u16::try_from(code.tries.len())
        .map_err(|_| encoding_error!("{} try items exceed 16 bits", code.tries.len()))?;
    out.write_le(code.registers);
    out.write_le(code.ins);
    out.write_le(code.outs);
    out.write_le(tries);
    let slot = out.len();
    out.write_le(0u32);
    out.write_le(code.insns.len() as u32);
    for &unit in &code.insns {
        out.write_le(unit);
    }
    if code.tries.is_empty() {
        return Ok(slot);
    }
    if code.insns.len() % 2 == 1 {
        out.write_le(0u16);
    }

    let mut handlers = Vec::new();
    handlers.write_uleb128(code.handlers.len() as u32);
    let mut handler_offsets = Vec::with_capacity(code.handlers.len());
    for handler in &code.handlers {
        handler_offsets.push(narrow(handlers.len() as u32, "handler offset")?);
        let count = handler.catches.len() as i32;
        handlers.write_sleb128(if handler.catch_all.is_some() { -count } else { count });
        for &(ty, address) in &handler.catches {
            handlers.write_uleb128(ty);
            handlers.write_uleb128(address);
        }
        if let Some(address) = handler.catch_all {
            handlers.write_uleb128(address);
        }
    }
    for item in &code.tries {
        let offset = handler_offsets
            .get(item.handler)
            .copied()
            .ok_or_else(|| encoding_error!("try item names missing handler {}", item.handler))?;
        out.write_le(item.start);
        out.write_le(item.count);
        out.write_le(offset);
    }
    out.extend_from_slice(&handlers);
    Ok(slot)
}

fn write_class_data(out: &mut Vec<u8>, class: &ClassDefinition, code: &[u32]) -> Result<()> {
    out.write_uleb128(class.static_fields.len() as u32);
    out.write_uleb128(class.instance_fields.len() as u32);
    out.write_uleb128(class.direct_methods.len() as u32);
    out.write_uleb128(class.virtual_methods.len() as u32);

    let write_fields = |out: &mut Vec<u8>, fields: &[EncodedField]| -> Result<()> {
        let mut previous = None;
        for field in fields {
            out.write_uleb128(index_diff(previous, field.field)?);
            out.write_uleb128(field.access.bits());
            previous = Some(field.field);
        }
        Ok(())
    };
    write_fields(out, &class.static_fields)?;
    write_fields(out, &class.instance_fields)?;

    let (direct_code, virtual_code) = code.split_at(class.direct_methods.len().min(code.len()));
    let write_methods = |out: &mut Vec<u8>, methods: &[EncodedMethod], code: &[u32]| -> Result<()> {
        let mut previous = None;
        for (method, &code_off) in methods.iter().zip(code) {
            out.write_uleb128(index_diff(previous, method.method)?);
            out.write_uleb128(method.access.bits());
            out.write_uleb128(code_off);
            previous = Some(method.method);
        }
        Ok(())
    };
    write_methods(out, &class.direct_methods, direct_code)?;
    write_methods(out, &class.virtual_methods, virtual_code)?;
    Ok(())
}

/// Member indices are delta-encoded and must strictly increase within a list.
fn index_diff(previous: Option<u32>, index: u32) -> Result<u32> {
    match previous {
        None => Ok(index),
        Some(previous) if index > previous => Ok(index - previous),
        Some(previous) => Err(encoding_error!(
            "member index {} does not follow {}",
            index,
            previous
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{pool::PoolBuilder, CatchHandler, TryItem},
        file::io::read_le_at,
        types::{AccessFlags, MethodRef, TypeId},
    };

    fn tiny_unit() -> Unit {
        let owner = TypeId::class("a/B");
        let run = MethodRef::new(owner.clone(), "run", TypeId::Void, vec![TypeId::Int]);
        let mut pool = PoolBuilder::new();
        pool.add_type(&owner);
        pool.add_type(&TypeId::object());
        pool.add_method(&run);
        let pool = pool.finish();
        let class = ClassDefinition {
            class: pool.type_id(&owner).unwrap(),
            access: AccessFlags::PUBLIC,
            superclass: Some(pool.type_id(&TypeId::object()).unwrap()),
            interfaces: Vec::new(),
            source_file: None,
            static_fields: Vec::new(),
            instance_fields: Vec::new(),
            direct_methods: vec![EncodedMethod {
                method: pool.method(&run).unwrap(),
                access: AccessFlags::PUBLIC | AccessFlags::STATIC,
                code: Some(CodeItem {
                    registers: 1,
                    ins: 1,
                    outs: 0,
                    // nop; return-void
                    insns: vec![0x0000, 0x000e],
                    tries: vec![TryItem {
                        start: 0,
                        count: 1,
                        handler: 0,
                    }],
                    handlers: vec![CatchHandler {
                        catches: Vec::new(),
                        catch_all: Some(1),
                    }],
                    debug: None,
                }),
            }],
            virtual_methods: Vec::new(),
        };
        Unit {
            pool,
            classes: vec![class],
        }
    }

    #[test]
    fn test_header_fields() {
        let bytes = write(&tiny_unit()).unwrap();
        assert_eq!(&bytes[..8], &MAGIC);
        let field = |offset: usize| read_le_at::<u32>(&bytes, &mut offset.clone()).unwrap();
        assert_eq!(field(32) as usize, bytes.len());
        assert_eq!(field(36), HEADER_SIZE);
        assert_eq!(field(40), ENDIAN_TAG);
        assert_eq!(field(8), adler32(&bytes[12..]));
        assert_eq!(&bytes[12..32], Sha1::digest(&bytes[32..]).as_slice());
        // Data runs to the end of the file.
        assert_eq!((field(108) + field(104)) as usize, bytes.len());
        // The map list is the last, 4-aligned item.
        let map_off = field(52) as usize;
        assert_eq!(map_off % 4, 0);
        let entries = field(map_off) as usize;
        assert_eq!(map_off + 4 + entries * 12, bytes.len());
    }

    #[test]
    fn test_deterministic() {
        let unit = tiny_unit();
        assert_eq!(write(&unit).unwrap(), write(&unit).unwrap());
    }

    #[test]
    fn test_index_diff_rejects_unsorted() {
        assert_eq!(index_diff(None, 4).unwrap(), 4);
        assert_eq!(index_diff(Some(4), 9).unwrap(), 5);
        assert!(index_diff(Some(4), 4).is_err());
    }

    #[test]
    fn test_code_item_padding_before_tries() {
        let mut out = Vec::new();
        let code = CodeItem {
            registers: 1,
            ins: 0,
            outs: 0,
            insns: vec![0x000e],
            tries: vec![TryItem {
                start: 0,
                count: 1,
                handler: 0,
            }],
            handlers: vec![CatchHandler {
                catches: vec![(3, 0)],
                catch_all: None,
            }],
            debug: None,
        };
        write_code(&mut out, &code).unwrap();
        // 16 header bytes, one unit, two bytes padding, one try item of eight bytes.
        assert_eq!(out.len(), 16 + 2 + 2 + 8 + 4);
        // Handler list: one handler at byte offset 1, size 1, type 3, address 0.
        assert_eq!(&out[28..], &[1, 1, 3, 0]);
        assert_eq!(u16::from_le_bytes([out[26], out[27]]), 1);
    }
}
