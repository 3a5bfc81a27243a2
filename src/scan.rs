use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::MethodFlags;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::cfg::build_cfg;
use crate::ir::{
    CallKind, CallSite, Class, ExceptionHandler, Instruction, InstructionKind, LineNumber, Method,
    MethodAccess,
};
use crate::opcodes;

/// Fatal corpus-level failures. Individual unreadable or malformed entries
/// are skipped with a warning instead.
#[derive(Debug, Error)]
pub(crate) enum CorpusError {
    #[error("input not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("unsupported input file: {}", path.display())]
    Unsupported { path: PathBuf },
}

/// Decoded classes plus counters for logging and the verbose banner.
pub(crate) struct ScanOutput {
    pub(crate) classes: Vec<Class>,
    pub(crate) class_count: usize,
    pub(crate) skipped_count: usize,
}

/// Enumerate and decode every class reachable from `input`, which may be a
/// `.class` file, a `.jar` archive, or a directory mixing both. Classes are
/// decoded in parallel per corpus target; the merged output preserves the
/// sorted target order so repeated runs are deterministic.
pub(crate) fn scan_input(input: &Path) -> Result<ScanOutput> {
    if !input.exists() {
        return Err(CorpusError::NotFound {
            path: input.to_path_buf(),
        }
        .into());
    }

    let targets = collect_targets(input)?;
    let mut results = targets
        .par_iter()
        .enumerate()
        .map(|(index, target)| {
            let output = scan_target(target, input)?;
            Ok((index, output))
        })
        .collect::<Result<Vec<_>>>()?;
    results.sort_by_key(|(index, _)| *index);

    let mut merged = ScanOutput {
        classes: Vec::new(),
        class_count: 0,
        skipped_count: 0,
    };
    for (_, output) in results {
        merged.classes.extend(output.classes);
        merged.class_count += output.class_count;
        merged.skipped_count += output.skipped_count;
    }
    Ok(merged)
}

/// Corpus entries that contribute classes: individual class files and jars.
#[derive(Debug)]
enum ScanTarget {
    ClassFile(PathBuf),
    Jar(PathBuf),
}

fn collect_targets(input: &Path) -> Result<Vec<ScanTarget>> {
    if input.is_dir() {
        let mut targets = Vec::new();
        collect_dir_targets(input, &mut targets)?;
        return Ok(targets);
    }

    match extension(input) {
        "class" => Ok(vec![ScanTarget::ClassFile(input.to_path_buf())]),
        "jar" => Ok(vec![ScanTarget::Jar(input.to_path_buf())]),
        _ => Err(CorpusError::Unsupported {
            path: input.to_path_buf(),
        }
        .into()),
    }
}

fn collect_dir_targets(path: &Path, targets: &mut Vec<ScanTarget>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    // Sorted listings keep parallel scans deterministic at class granularity.
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_dir_targets(&entry, targets)?;
        } else {
            match extension(&entry) {
                "class" => targets.push(ScanTarget::ClassFile(entry)),
                "jar" => targets.push(ScanTarget::Jar(entry)),
                _ => {}
            }
        }
    }
    Ok(())
}

fn scan_target(target: &ScanTarget, input: &Path) -> Result<ScanOutput> {
    match target {
        ScanTarget::ClassFile(path) => scan_class_file(path),
        ScanTarget::Jar(path) => scan_jar_file(path, path.as_path() == input),
    }
}

fn scan_class_file(path: &Path) -> Result<ScanOutput> {
    let mut output = ScanOutput {
        classes: Vec::new(),
        class_count: 0,
        skipped_count: 0,
    };
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!("skipping unreadable class file {}: {err}", path.display());
            output.skipped_count += 1;
            return Ok(output);
        }
    };
    match decode_class(&data) {
        Ok(class) => {
            debug!("decoded class {} from {}", class.name, path.display());
            output.classes.push(class);
            output.class_count += 1;
        }
        Err(err) => {
            warn!("skipping malformed class file {}: {err:#}", path.display());
            output.skipped_count += 1;
        }
    }
    Ok(output)
}

fn scan_jar_file(path: &Path, is_input: bool) -> Result<ScanOutput> {
    let mut output = ScanOutput {
        classes: Vec::new(),
        class_count: 0,
        skipped_count: 0,
    };
    let archive = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))
        .and_then(|file| {
            ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))
        });
    let mut archive = match archive {
        Ok(archive) => archive,
        // A jar that is the scan input must be readable; jars discovered
        // inside a directory corpus are skipped like any other bad entry.
        Err(err) if !is_input => {
            warn!("skipping unreadable archive {}: {err:#}", path.display());
            output.skipped_count += 1;
            return Ok(output);
        }
        Err(err) => return Err(err),
    };

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    let mut entry_bytes = Vec::with_capacity(entry_names.len());
    for name in &entry_names {
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry {}:{name}: {err}", path.display());
                output.skipped_count += 1;
                continue;
            }
        };
        let mut data = Vec::new();
        if let Err(err) = entry.read_to_end(&mut data) {
            warn!("skipping unreadable entry {}:{name}: {err}", path.display());
            output.skipped_count += 1;
            continue;
        }
        entry_bytes.push((name.clone(), data));
    }

    let decoded = entry_bytes
        .par_iter()
        .map(|(name, data)| (name, decode_class(data)))
        .collect::<Vec<_>>();
    for (name, result) in decoded {
        match result {
            Ok(class) => {
                debug!("decoded class {} from {}:{name}", class.name, path.display());
                output.classes.push(class);
                output.class_count += 1;
            }
            Err(err) => {
                warn!(
                    "skipping malformed entry {}:{name}: {err:#}",
                    path.display()
                );
                output.skipped_count += 1;
            }
        }
    }
    Ok(output)
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("")
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Decode class file bytes into the scanner's intermediate form.
pub(crate) fn decode_class(data: &[u8]) -> Result<Class> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let class_name = resolve_class_name(constant_pool, class_file.this_class())
        .context("resolve class name")?
        .replace('/', ".");
    let source_file =
        parse_source_file(class_file.attributes(), constant_pool).context("parse source file")?;
    let methods = parse_methods(constant_pool, class_file.methods())
        .with_context(|| format!("parse methods of {class_name}"))?;

    Ok(Class {
        name: class_name,
        source_file,
        methods,
    })
}

fn parse_source_file(
    attributes: &[jclassfile::attributes::Attribute],
    constant_pool: &[ConstantPool],
) -> Result<Option<String>> {
    for attribute in attributes {
        let jclassfile::attributes::Attribute::SourceFile { sourcefile_index } = attribute else {
            continue;
        };
        let source_file =
            resolve_utf8(constant_pool, *sourcefile_index).context("resolve source file")?;
        return Ok(Some(source_file));
    }
    Ok(None)
}

fn parse_methods(
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods {
        let name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let access_flags = method.access_flags();
        let access = MethodAccess {
            is_static: access_flags.contains(MethodFlags::ACC_STATIC),
            is_abstract: access_flags.contains(MethodFlags::ACC_ABSTRACT),
        };
        let code = method
            .attributes()
            .iter()
            .find_map(|attribute| match attribute {
                jclassfile::attributes::Attribute::Code {
                    code,
                    exception_table,
                    attributes,
                    ..
                } => Some((code, exception_table, attributes)),
                _ => None,
            });
        let Some((code, exception_table, code_attributes)) = code else {
            parsed.push(Method {
                name,
                descriptor,
                access,
                has_body: false,
                bytecode: Vec::new(),
                instructions: Vec::new(),
                cfg: crate::cfg::ControlFlowGraph {
                    blocks: Vec::new(),
                    edges: Vec::new(),
                },
                line_numbers: Vec::new(),
                exception_handlers: Vec::new(),
            });
            continue;
        };
        let line_numbers = parse_line_numbers(code_attributes, constant_pool)?;
        let instructions =
            parse_bytecode(code, constant_pool).with_context(|| format!("parse bytecode of {name}"))?;
        let exception_handlers = parse_exception_handlers(exception_table);
        let handler_offsets = exception_handlers
            .iter()
            .map(|handler| handler.handler_pc)
            .collect::<Vec<_>>();
        let cfg = build_cfg(code, &instructions, &handler_offsets)
            .with_context(|| format!("build control flow graph of {name}"))?;
        parsed.push(Method {
            name,
            descriptor,
            access,
            has_body: true,
            bytecode: code.clone(),
            instructions,
            cfg,
            line_numbers,
            exception_handlers,
        });
    }
    Ok(parsed)
}

fn parse_line_numbers(
    attributes: &[jclassfile::attributes::Attribute],
    _constant_pool: &[ConstantPool],
) -> Result<Vec<LineNumber>> {
    let mut entries = Vec::new();
    for attribute in attributes {
        let jclassfile::attributes::Attribute::LineNumberTable { line_number_table } = attribute
        else {
            continue;
        };
        for record in line_number_table {
            entries.push(LineNumber {
                start_pc: record.start_pc() as u32,
                line: record.line_number() as u32,
            });
        }
    }
    entries.sort_by_key(|entry| entry.start_pc);
    Ok(entries)
}

fn parse_exception_handlers(
    table: &[jclassfile::attributes::ExceptionRecord],
) -> Vec<ExceptionHandler> {
    table
        .iter()
        .map(|entry| ExceptionHandler {
            start_pc: entry.start_pc() as u32,
            end_pc: entry.end_pc() as u32,
            handler_pc: entry.handler_pc() as u32,
        })
        .collect()
}

fn parse_bytecode(code: &[u8], constant_pool: &[ConstantPool]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start_offset = offset as u32;
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_index = read_u16(code, offset + 1)?;
                let method_ref = resolve_method_ref(constant_pool, method_index)
                    .context("resolve method ref")?;
                let call_kind = match opcode {
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    opcodes::INVOKEINTERFACE => CallKind::Interface,
                    _ => CallKind::Virtual,
                };
                InstructionKind::Invoke(CallSite {
                    owner: method_ref.owner.replace('/', "."),
                    name: method_ref.name,
                    descriptor: method_ref.descriptor,
                    kind: call_kind,
                    offset: start_offset,
                })
            }
            opcodes::INVOKEDYNAMIC => {
                let call_site_index = read_u16(code, offset + 1)?;
                let (name, descriptor) =
                    resolve_invoke_dynamic(constant_pool, call_site_index)
                        .context("resolve invoke dynamic")?;
                InstructionKind::Invoke(CallSite {
                    owner: "<invokedynamic>".to_string(),
                    name,
                    descriptor,
                    kind: CallKind::Dynamic,
                    offset: start_offset,
                })
            }
            opcodes::LDC => {
                let index = code.get(offset + 1).copied().context("ldc index")? as u16;
                match resolve_string_literal(constant_pool, index)? {
                    Some(value) => InstructionKind::ConstString(value),
                    None => InstructionKind::Other(opcode),
                }
            }
            opcodes::LDC_W => {
                let index = read_u16(code, offset + 1)?;
                match resolve_string_literal(constant_pool, index)? {
                    Some(value) => InstructionKind::ConstString(value),
                    None => InstructionKind::Other(opcode),
                }
            }
            opcodes::ALOAD => {
                let slot = code.get(offset + 1).copied().context("aload index")? as u16;
                InstructionKind::LoadLocal(slot)
            }
            opcodes::ALOAD_0..=opcodes::ALOAD_3 => {
                InstructionKind::LoadLocal((opcode - opcodes::ALOAD_0) as u16)
            }
            opcodes::ISTORE..=opcodes::ASTORE => {
                let slot = code.get(offset + 1).copied().context("store index")? as u16;
                InstructionKind::StoreLocal(slot)
            }
            opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
                InstructionKind::StoreLocal(((opcode - opcodes::ISTORE_0) % 4) as u16)
            }
            opcodes::WIDE => {
                let wide_opcode = code.get(offset + 1).copied().context("wide opcode")?;
                let slot = read_u16(code, offset + 2)?;
                match wide_opcode {
                    opcodes::ALOAD => InstructionKind::LoadLocal(slot),
                    opcodes::ISTORE..=opcodes::ASTORE => InstructionKind::StoreLocal(slot),
                    _ => InstructionKind::Other(opcode),
                }
            }
            _ => InstructionKind::Other(opcode),
        };

        instructions.push(Instruction {
            offset: start_offset,
            opcode,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

/// Resolved constant pool method reference.
struct MethodRef {
    owner: String,
    name: String,
    descriptor: String,
}

fn resolve_method_ref(constant_pool: &[ConstantPool], index: u16) -> Result<MethodRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing method ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected method ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name_index, descriptor_index) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    let name = resolve_utf8(constant_pool, name_index).context("resolve method name")?;
    let descriptor =
        resolve_utf8(constant_pool, descriptor_index).context("resolve method descriptor")?;
    Ok(MethodRef {
        owner,
        name,
        descriptor,
    })
}

fn resolve_invoke_dynamic(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing invoke dynamic entry")?;
    let name_and_type_index = match entry {
        ConstantPool::InvokeDynamic {
            name_and_type_index,
            ..
        } => *name_and_type_index,
        _ => anyhow::bail!("unexpected invoke dynamic entry"),
    };
    let (name_index, descriptor_index) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    let name = resolve_utf8(constant_pool, name_index).context("resolve invoke dynamic name")?;
    let descriptor = resolve_utf8(constant_pool, descriptor_index)
        .context("resolve invoke dynamic descriptor")?;
    Ok((name, descriptor))
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(u16, u16)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((*name_index, *descriptor_index)),
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

fn resolve_string_literal(constant_pool: &[ConstantPool], index: u16) -> Result<Option<String>> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing constant pool entry")?;
    match entry {
        ConstantPool::String { string_index } => {
            let value = resolve_utf8(constant_pool, *string_index)?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x4e => 1,
        0x4f..=0x56 => 1,
        0x57..=0x5f => 1,
        0x60..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC {
        Ok(6)
    } else {
        Ok(4)
    }
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
