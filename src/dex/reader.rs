//! The reference reader.
//!
//! [`DexFile::parse`] decodes a container back into the [`Unit`] model and checks every
//! invariant the writer promises along the way: magic, size, checksum and signature in the
//! header, a map list that agrees with the header, sorted constant tables, prototype shorties
//! that match their types, and code items whose try ranges and handlers are consistent.
//!
//! The reader backs the round-trip tests, validates cached units before they are handed out,
//! and drives the `dump` command of the command line tool.

use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::{
    dex::{
        debug::DebugInfo, writer::map, CatchHandler, ClassDefinition, CodeItem, EncodedField,
        EncodedMethod, Pool, TryItem, Unit, ENDIAN_TAG, HEADER_SIZE, MAGIC, NO_INDEX,
    },
    file::{io::read_le_at, mutf8, Parser},
    types::{AccessFlags, FieldRef, MethodRef, Prototype, TypeId},
    utils::adler32,
    Result,
};

/// One entry of the map list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapItem {
    /// Item type code.
    pub kind: u16,
    /// Number of items.
    pub size: u32,
    /// Offset of the first item.
    pub offset: u32,
}

/// A decoded container.
#[derive(Debug, Clone)]
pub struct DexFile {
    unit: Unit,
    checksum: u32,
    signature: [u8; 20],
    map: Vec<MapItem>,
}

/// `(size, offset)` pairs of the header.
#[derive(Default)]
struct Sections {
    strings: (u32, u32),
    types: (u32, u32),
    protos: (u32, u32),
    fields: (u32, u32),
    methods: (u32, u32),
    classes: (u32, u32),
    data: (u32, u32),
}

impl DexFile {
    /// Decodes and validates a container.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for any violated invariant and
    /// [`crate::Error::OutOfBounds`] for offsets that point outside the data.
    pub fn parse(data: &[u8]) -> Result<DexFile> {
        if data.len() < HEADER_SIZE as usize {
            return Err(malformed_error!("{} bytes is too short for a header", data.len()));
        }
        if data[..8] != MAGIC {
            return Err(malformed_error!("bad magic {:02x?}", &data[..8]));
        }
        let mut parser = Parser::at(data, 8)?;
        let checksum = parser.read_le::<u32>()?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(parser.read_bytes(20)?);
        let file_size = parser.read_le::<u32>()?;
        let header_size = parser.read_le::<u32>()?;
        let endian = parser.read_le::<u32>()?;
        let link = (parser.read_le::<u32>()?, parser.read_le::<u32>()?);
        let map_off = parser.read_le::<u32>()?;

        if file_size as usize != data.len() {
            return Err(malformed_error!(
                "header claims {} bytes, got {}",
                file_size,
                data.len()
            ));
        }
        if header_size != HEADER_SIZE {
            return Err(malformed_error!("header size {:#x}", header_size));
        }
        if endian != ENDIAN_TAG {
            return Err(malformed_error!("unsupported endian tag {:#x}", endian));
        }
        if link != (0, 0) {
            return Err(malformed_error!("link sections are not supported"));
        }
        if adler32(&data[12..]) != checksum {
            return Err(malformed_error!("checksum mismatch"));
        }
        if Sha1::digest(&data[32..]).as_slice() != signature {
            return Err(malformed_error!("signature mismatch"));
        }

        let mut pair = || -> Result<(u32, u32)> { Ok((parser.read_le()?, parser.read_le()?)) };
        let sections = Sections {
            strings: pair()?,
            types: pair()?,
            protos: pair()?,
            fields: pair()?,
            methods: pair()?,
            classes: pair()?,
            data: pair()?,
        };

        let map = read_map(data, map_off, &sections)?;
        let pool = read_pool(data, &sections)?;
        pool.validate_order()?;

        let (count, offset) = sections.classes;
        let mut classes = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            classes.push(read_class(data, offset as usize + i * 32, &pool)?);
        }

        Ok(DexFile {
            unit: Unit { pool, classes },
            checksum,
            signature,
            map,
        })
    }

    /// Constant tables.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.unit.pool
    }

    /// Class definitions in file order.
    #[must_use]
    pub fn classes(&self) -> &[ClassDefinition] {
        &self.unit.classes
    }

    /// The decoded unit.
    #[must_use]
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Consumes the file, returning the decoded unit.
    #[must_use]
    pub fn into_unit(self) -> Unit {
        self.unit
    }

    /// Header checksum.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Header signature.
    #[must_use]
    pub fn signature(&self) -> &[u8; 20] {
        &self.signature
    }

    /// The map list.
    #[must_use]
    pub fn map(&self) -> &[MapItem] {
        &self.map
    }

    /// Finds a method defined in this unit by class descriptor and name.
    #[must_use]
    pub fn find_method(&self, class: &str, name: &str) -> Option<(&MethodRef, &EncodedMethod)> {
        let pool = self.pool();
        self.classes()
            .iter()
            .filter(|c| {
                pool.types()
                    .get(c.class as usize)
                    .is_some_and(|ty| ty.descriptor() == class)
            })
            .flat_map(ClassDefinition::methods)
            .find_map(|m| {
                let method = pool.methods().get(m.method as usize)?;
                (method.name == name).then_some((method, m))
            })
    }
}

fn entry<'a, T>(table: &'a [T], index: u32, what: &str) -> Result<&'a T> {
    table
        .get(index as usize)
        .ok_or_else(|| malformed_error!("{} index {} out of range", what, index))
}

fn read_map(data: &[u8], map_off: u32, sections: &Sections) -> Result<Vec<MapItem>> {
    if map_off % 4 != 0 {
        return Err(malformed_error!("map list at unaligned offset {:#x}", map_off));
    }
    let mut parser = Parser::at(data, map_off as usize)?;
    let count = parser.read_le::<u32>()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = parser.read_le::<u16>()?;
        parser.read_le::<u16>()?;
        let size = parser.read_le::<u32>()?;
        let offset = parser.read_le::<u32>()?;
        items.push(MapItem { kind, size, offset });
    }

    if items.first() != Some(&MapItem { kind: map::HEADER, size: 1, offset: 0 }) {
        return Err(malformed_error!("map list does not start with the header"));
    }
    if !items.windows(2).all(|w| w[0].offset < w[1].offset) {
        return Err(malformed_error!("map list is not in offset order"));
    }
    let mut seen = FxHashMap::default();
    for item in &items {
        if seen.insert(item.kind, item).is_some() {
            return Err(malformed_error!("map list repeats type {:#06x}", item.kind));
        }
    }
    for (kind, (size, offset)) in [
        (map::STRING_ID, sections.strings),
        (map::TYPE_ID, sections.types),
        (map::PROTO_ID, sections.protos),
        (map::FIELD_ID, sections.fields),
        (map::METHOD_ID, sections.methods),
        (map::CLASS_DEF, sections.classes),
    ] {
        let expected = (size > 0).then_some((size, offset));
        let listed = seen.get(&kind).map(|item| (item.size, item.offset));
        if listed != expected {
            return Err(malformed_error!(
                "map entry {:#06x} {:?} disagrees with header {:?}",
                kind,
                listed,
                expected
            ));
        }
    }
    let (data_size, data_off) = sections.data;
    if seen.get(&map::MAP_LIST).map(|item| item.offset) != Some(map_off) {
        return Err(malformed_error!("map list does not list itself"));
    }
    let data_end = data_off as usize + data_size as usize;
    if map_off < data_off || data_end != data.len() {
        return Err(malformed_error!("data section {:#x}+{:#x} is inconsistent", data_off, data_size));
    }
    Ok(items)
}

fn read_type_list(data: &[u8], offset: u32, types: &[TypeId]) -> Result<Vec<TypeId>> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    if offset % 4 != 0 {
        return Err(malformed_error!("type list at unaligned offset {:#x}", offset));
    }
    let mut parser = Parser::at(data, offset as usize)?;
    let count = parser.read_le::<u32>()?;
    (0..count)
        .map(|_| {
            let index = parser.read_le::<u16>()?;
            entry(types, u32::from(index), "type").cloned()
        })
        .collect()
}

fn read_pool(data: &[u8], sections: &Sections) -> Result<Pool> {
    let (count, offset) = sections.strings;
    let mut strings = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let mut at = offset as usize + i * 4;
        let string_off = read_le_at::<u32>(data, &mut at)?;
        let mut parser = Parser::at(data, string_off as usize)?;
        let units = parser.read_uleb128()?;
        let value = parser.read_mutf8()?;
        if mutf8::utf16_len(&value) != units as usize {
            return Err(malformed_error!("string {} claims {} code units", i, units));
        }
        strings.push(value);
    }

    let (count, offset) = sections.types;
    let mut types = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let mut at = offset as usize + i * 4;
        let index = read_le_at::<u32>(data, &mut at)?;
        let descriptor = entry(&strings, index, "string")?;
        let ty = TypeId::parse(descriptor)
            .map_err(|_| malformed_error!("bad type descriptor {:?}", descriptor))?;
        types.push(ty);
    }

    let (count, offset) = sections.protos;
    let mut protos = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let mut at = offset as usize + i * 12;
        let shorty = read_le_at::<u32>(data, &mut at)?;
        let ret = read_le_at::<u32>(data, &mut at)?;
        let params = read_le_at::<u32>(data, &mut at)?;
        let proto = Prototype::new(
            entry(&types, ret, "type")?.clone(),
            read_type_list(data, params, &types)?,
        );
        let shorty = entry(&strings, shorty, "string")?;
        if *shorty != proto.shorty() {
            return Err(malformed_error!("shorty {:?} does not match {}", shorty, proto));
        }
        protos.push(proto);
    }

    let (count, offset) = sections.fields;
    let mut fields = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let mut at = offset as usize + i * 8;
        let class = read_le_at::<u16>(data, &mut at)?;
        let ty = read_le_at::<u16>(data, &mut at)?;
        let name = read_le_at::<u32>(data, &mut at)?;
        fields.push(FieldRef::new(
            entry(&types, u32::from(class), "type")?.clone(),
            entry(&strings, name, "string")?.clone(),
            entry(&types, u32::from(ty), "type")?.clone(),
        ));
    }

    let (count, offset) = sections.methods;
    let mut methods = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let mut at = offset as usize + i * 8;
        let class = read_le_at::<u16>(data, &mut at)?;
        let proto = read_le_at::<u16>(data, &mut at)?;
        let name = read_le_at::<u32>(data, &mut at)?;
        methods.push(MethodRef {
            owner: entry(&types, u32::from(class), "type")?.clone(),
            name: entry(&strings, name, "string")?.clone(),
            proto: entry(&protos, u32::from(proto), "prototype")?.clone(),
        });
    }

    Ok(Pool::from_tables(strings, types, protos, fields, methods))
}

fn optional_index(value: u32) -> Option<u32> {
    (value != NO_INDEX).then_some(value)
}

fn read_class(data: &[u8], offset: usize, pool: &Pool) -> Result<ClassDefinition> {
    let mut parser = Parser::at(data, offset)?;
    let class = parser.read_le::<u32>()?;
    let access = AccessFlags::from_bits_retain(parser.read_le::<u32>()?);
    let superclass = optional_index(parser.read_le::<u32>()?);
    let interfaces_off = parser.read_le::<u32>()?;
    let source_file = optional_index(parser.read_le::<u32>()?);
    let _annotations = parser.read_le::<u32>()?;
    let class_data_off = parser.read_le::<u32>()?;
    let _static_values = parser.read_le::<u32>()?;

    entry(pool.types(), class, "class type")?;
    if let Some(superclass) = superclass {
        entry(pool.types(), superclass, "superclass type")?;
    }
    if let Some(source_file) = source_file {
        entry(pool.strings(), source_file, "source file")?;
    }
    let interfaces = read_type_list(data, interfaces_off, pool.types())?
        .iter()
        .map(|ty| pool.type_id(ty))
        .collect::<Result<Vec<_>>>()?;

    let mut definition = ClassDefinition {
        class,
        access,
        superclass,
        interfaces,
        source_file,
        static_fields: Vec::new(),
        instance_fields: Vec::new(),
        direct_methods: Vec::new(),
        virtual_methods: Vec::new(),
    };
    if class_data_off == 0 {
        return Ok(definition);
    }

    let mut parser = Parser::at(data, class_data_off as usize)?;
    let counts = [
        parser.read_uleb128()?,
        parser.read_uleb128()?,
        parser.read_uleb128()?,
        parser.read_uleb128()?,
    ];
    for (slot, count) in [&mut definition.static_fields, &mut definition.instance_fields]
        .into_iter()
        .zip(&counts[..2])
    {
        let mut index = 0u32;
        for i in 0..*count {
            let diff = parser.read_uleb128()?;
            if i > 0 && diff == 0 {
                return Err(malformed_error!("duplicate field in class data"));
            }
            index = index.checked_add(diff).ok_or_else(|| malformed_error!("field index overflow"))?;
            entry(pool.fields(), index, "field")?;
            let access = AccessFlags::from_bits_retain(parser.read_uleb128()?);
            slot.push(EncodedField { field: index, access });
        }
    }
    for (slot, count) in [&mut definition.direct_methods, &mut definition.virtual_methods]
        .into_iter()
        .zip(&counts[2..])
    {
        let mut index = 0u32;
        for i in 0..*count {
            let diff = parser.read_uleb128()?;
            if i > 0 && diff == 0 {
                return Err(malformed_error!("duplicate method in class data"));
            }
            index = index.checked_add(diff).ok_or_else(|| malformed_error!("method index overflow"))?;
            entry(pool.methods(), index, "method")?;
            let access = AccessFlags::from_bits_retain(parser.read_uleb128()?);
            let code_off = parser.read_uleb128()?;
            let code = if code_off == 0 {
                None
            } else {
                Some(read_code(data, code_off, pool)?)
            };
            slot.push(EncodedMethod { method: index, access, code });
        }
    }
    Ok(definition)
}

fn read_code(data: &[u8], offset: u32, pool: &Pool) -> Result<CodeItem> {
    if offset % 4 != 0 {
        return Err(malformed_error!("code item at unaligned offset {:#x}", offset));
    }
    let mut parser = Parser::at(data, offset as usize)?;
    let registers = parser.read_le::<u16>()?;
    let ins = parser.read_le::<u16>()?;
    let outs = parser.read_le::<u16>()?;
    let tries_size = parser.read_le::<u16>()?;
    let debug_off = parser.read_le::<u32>()?;
    let insns_size = parser.read_le::<u32>()?;
    if ins > registers {
        return Err(malformed_error!("{} ins exceed {} registers", ins, registers));
    }
    let insns = (0..insns_size)
        .map(|_| parser.read_le::<u16>())
        .collect::<Result<Vec<_>>>()?;

    let mut tries = Vec::with_capacity(tries_size as usize);
    let mut handlers = Vec::new();
    if tries_size > 0 {
        if insns_size % 2 == 1 {
            parser.read_le::<u16>()?;
        }
        let mut raw = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size {
            let start = parser.read_le::<u32>()?;
            let count = parser.read_le::<u16>()?;
            let handler_off = parser.read_le::<u16>()?;
            if start as usize + count as usize > insns.len() {
                return Err(malformed_error!("try range {:#x}+{} past the code", start, count));
            }
            raw.push((start, count, handler_off));
        }

        let list_start = parser.pos();
        let mut by_offset = FxHashMap::default();
        let count = parser.read_uleb128()?;
        for index in 0..count as usize {
            by_offset.insert(parser.pos() - list_start, index);
            let size = parser.read_sleb128()?;
            let mut handler = CatchHandler::default();
            for _ in 0..size.unsigned_abs() {
                let ty = parser.read_uleb128()?;
                entry(pool.types(), ty, "catch type")?;
                handler.catches.push((ty, parser.read_uleb128()?));
            }
            if size <= 0 {
                handler.catch_all = Some(parser.read_uleb128()?);
            }
            handlers.push(handler);
        }
        for (start, count, handler_off) in raw {
            let handler = by_offset
                .get(&(handler_off as usize))
                .copied()
                .ok_or_else(|| malformed_error!("try item points inside a handler"))?;
            tries.push(TryItem { start, count, handler });
        }
        if !tries.windows(2).all(|w| w[0].start + u32::from(w[0].count) <= w[1].start) {
            return Err(malformed_error!("try items overlap or are unsorted"));
        }
    }

    let debug = if debug_off == 0 {
        None
    } else {
        Some(DebugInfo::decode(&mut Parser::at(data, debug_off as usize)?)?)
    };
    Ok(CodeItem {
        registers,
        ins,
        outs,
        insns,
        tries,
        handlers,
        debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{writer::write, PoolBuilder},
        types::MethodRef,
    };

    fn unit() -> Unit {
        let owner = TypeId::class("p/Q");
        let iface = TypeId::class("java/lang/Runnable");
        let method = MethodRef::new(owner.clone(), "run", TypeId::Void, vec![]);
        let field = FieldRef::new(owner.clone(), "count", TypeId::Long);
        let mut pool = PoolBuilder::new();
        for ty in [&owner, &iface, &TypeId::object(), &TypeId::throwable()] {
            pool.add_type(ty);
        }
        pool.add_method(&method);
        pool.add_field(&field);
        pool.add_string("Q.java");
        let pool = pool.finish();
        let class = ClassDefinition {
            class: pool.type_id(&owner).unwrap(),
            access: AccessFlags::PUBLIC | AccessFlags::FINAL,
            superclass: Some(pool.type_id(&TypeId::object()).unwrap()),
            interfaces: vec![pool.type_id(&iface).unwrap()],
            source_file: Some(pool.string("Q.java").unwrap()),
            static_fields: vec![EncodedField {
                field: pool.field(&field).unwrap(),
                access: AccessFlags::STATIC,
            }],
            instance_fields: Vec::new(),
            direct_methods: Vec::new(),
            virtual_methods: vec![EncodedMethod {
                method: pool.method(&method).unwrap(),
                access: AccessFlags::PUBLIC,
                code: Some(CodeItem {
                    registers: 2,
                    ins: 1,
                    outs: 0,
                    // nop; nop; return-void
                    insns: vec![0x0000, 0x0000, 0x000e],
                    tries: vec![TryItem {
                        start: 0,
                        count: 2,
                        handler: 0,
                    }],
                    handlers: vec![CatchHandler {
                        catches: vec![(pool.type_id(&TypeId::throwable()).unwrap(), 2)],
                        catch_all: Some(2),
                    }],
                    debug: DebugInfo::from_positions(0, vec![(0, 3), (2, 4)]),
                }),
            }],
        };
        Unit {
            pool,
            classes: vec![class],
        }
    }

    #[test]
    fn test_round_trip() {
        let unit = unit();
        let bytes = write(&unit).unwrap();
        let file = DexFile::parse(&bytes).unwrap();
        assert_eq!(file.unit(), &unit);
        let (method, encoded) = file.find_method("Lp/Q;", "run").unwrap();
        assert_eq!(method.proto.ret, TypeId::Void);
        assert_eq!(encoded.code.as_ref().unwrap().insns.len(), 3);
        assert!(file.map().iter().any(|item| item.kind == map::TYPE_LIST));
    }

    #[test]
    fn test_rejects_corruption() {
        let bytes = write(&unit()).unwrap();

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(DexFile::parse(&flipped).is_err());

        assert!(DexFile::parse(&bytes[..bytes.len() - 4]).is_err());

        let mut magic = bytes.clone();
        magic[4] = b'9';
        assert!(DexFile::parse(&magic).is_err());
    }

    #[test]
    fn test_find_method_misses() {
        let bytes = write(&unit()).unwrap();
        let file = DexFile::parse(&bytes).unwrap();
        assert!(file.find_method("Lp/Q;", "walk").is_none());
        assert!(file.find_method("Lp/R;", "run").is_none());
    }
}
