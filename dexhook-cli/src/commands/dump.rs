use std::path::Path;

use anyhow::{bail, Context};
use dexhook::dex::{disasm::render_code, ClassDefinition, Pool};
use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_unit, output::print_output};

#[derive(Debug, Serialize)]
pub struct UnitDump {
    pub checksum: String,
    pub strings: usize,
    pub types: usize,
    pub protos: usize,
    pub fields: usize,
    pub methods: usize,
    pub classes: Vec<ClassDump>,
}

#[derive(Debug, Serialize)]
pub struct ClassDump {
    pub descriptor: String,
    pub access: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superclass: Option<String>,
    pub fields: Vec<String>,
    pub methods: Vec<MethodDump>,
}

#[derive(Debug, Serialize)]
pub struct MethodDump {
    pub signature: String,
    pub access: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<String>,
}

fn type_name(pool: &Pool, index: u32) -> String {
    pool.types()
        .get(index as usize)
        .map_or_else(|| format!("@{index}"), ToString::to_string)
}

fn dump_class(
    class: &ClassDefinition,
    pool: &Pool,
    method: Option<&str>,
) -> anyhow::Result<ClassDump> {
    let fields = class
        .static_fields
        .iter()
        .chain(&class.instance_fields)
        .map(|f| {
            pool.fields()
                .get(f.field as usize)
                .map_or_else(|| format!("@{}", f.field), ToString::to_string)
        })
        .collect();

    let mut methods = Vec::new();
    for encoded in class.methods() {
        let Some(reference) = pool.methods().get(encoded.method as usize) else {
            bail!("method index {} out of range", encoded.method);
        };
        if method.is_some_and(|name| reference.name != name) {
            continue;
        }
        let code = match &encoded.code {
            Some(code) => render_code(code, pool)
                .with_context(|| format!("failed to decode {reference}"))?
                .lines()
                .map(|line| line.trim_end().to_string())
                .collect(),
            None => Vec::new(),
        };
        methods.push(MethodDump {
            signature: reference.to_string(),
            access: encoded.access.bits(),
            registers: encoded.code.as_ref().map(|c| c.registers),
            code,
        });
    }

    Ok(ClassDump {
        descriptor: type_name(pool, class.class),
        access: class.access.bits(),
        superclass: class.superclass.map(|s| type_name(pool, s)),
        fields,
        methods,
    })
}

pub fn run(
    path: &Path,
    class: Option<&str>,
    method: Option<&str>,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let file = load_unit(path)?;
    let pool = file.pool();

    let mut classes = Vec::new();
    for definition in file.classes() {
        if class.is_some_and(|c| type_name(pool, definition.class) != c) {
            continue;
        }
        classes.push(dump_class(definition, pool, method)?);
    }
    if let Some(c) = class {
        if classes.is_empty() {
            bail!("{} does not define {c}", path.display());
        }
    }

    let dump = UnitDump {
        checksum: format!("{:08x}", file.checksum()),
        strings: pool.strings().len(),
        types: pool.types().len(),
        protos: pool.protos().len(),
        fields: pool.fields().len(),
        methods: pool.methods().len(),
        classes,
    };

    print_output(&dump, opts, |d| {
        println!(
            "checksum={} strings={} types={} protos={} fields={} methods={}",
            d.checksum, d.strings, d.types, d.protos, d.fields, d.methods
        );
        for class in &d.classes {
            println!();
            match &class.superclass {
                Some(superclass) => {
                    println!("class {} extends {} access={:#x}", class.descriptor, superclass, class.access);
                }
                None => println!("class {} access={:#x}", class.descriptor, class.access),
            }
            for field in &class.fields {
                println!("  field {field}");
            }
            for method in &class.methods {
                match method.registers {
                    Some(registers) => println!(
                        "  method {} access={:#x} registers={registers}",
                        method.signature, method.access
                    ),
                    None => println!("  method {} access={:#x}", method.signature, method.access),
                }
                for line in &method.code {
                    println!("  {line}");
                }
            }
        }
    })
}
