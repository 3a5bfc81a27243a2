//! Minimal class file writer for deterministic test fixtures.

/// Builds a syntactically valid class file with string constants, method
/// references, bytecode bodies, and optional line number tables.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    this_class: u16,
    super_class: u16,
    source_file: Option<u16>,
    methods: Vec<MethodSpec>,
    code_index: u16,
    line_table_index: u16,
    source_file_index: u16,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            this_class: 0,
            super_class: 0,
            source_file: None,
            methods: Vec::new(),
            code_index: 0,
            line_table_index: 0,
            source_file_index: 0,
        };
        builder.code_index = builder.add_utf8("Code");
        builder.line_table_index = builder.add_utf8("LineNumberTable");
        builder.source_file_index = builder.add_utf8("SourceFile");
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class("java/lang/Object");
        builder
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    /// String constant usable with `ldc`; keep fixtures under 255 entries.
    pub(crate) fn add_string(&mut self, value: &str) -> u16 {
        let value_index = self.add_utf8(value);
        self.cp.push(CpEntry::String(value_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp
            .push(CpEntry::NameAndType(name_index, descriptor_index));
        let name_and_type = self.cp.len() as u16;
        self.cp.push(CpEntry::MethodRef(class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn set_source_file(&mut self, name: &str) {
        let index = self.add_utf8(name);
        self.source_file = Some(index);
    }

    pub(crate) fn add_method(&mut self, access: u16, name: &str, descriptor: &str, code: Vec<u8>) {
        self.add_method_with_lines(access, name, descriptor, code, Vec::new());
    }

    /// `lines` holds `(start_pc, line_number)` pairs.
    pub(crate) fn add_method_with_lines(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        lines: Vec<(u16, u16)>,
    ) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access,
            name_index,
            descriptor_index,
            body: Some(MethodBody { code, lines }),
        });
    }

    /// Method without a Code attribute (abstract or native).
    pub(crate) fn add_bodyless_method(&mut self, access: u16, name: &str, descriptor: &str) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access,
            name_index,
            descriptor_index,
            body: None,
        });
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, 0x0021);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, method.access);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            match &method.body {
                Some(body) => {
                    write_u16(&mut bytes, 1);
                    write_u16(&mut bytes, self.code_index);
                    let line_attr_len = if body.lines.is_empty() {
                        0
                    } else {
                        6 + 2 + 4 * body.lines.len() as u32
                    };
                    write_u32(&mut bytes, 12 + body.code.len() as u32 + line_attr_len);
                    write_u16(&mut bytes, 8);
                    write_u16(&mut bytes, 8);
                    write_u32(&mut bytes, body.code.len() as u32);
                    bytes.extend_from_slice(&body.code);
                    write_u16(&mut bytes, 0);
                    if body.lines.is_empty() {
                        write_u16(&mut bytes, 0);
                    } else {
                        write_u16(&mut bytes, 1);
                        write_u16(&mut bytes, self.line_table_index);
                        write_u32(&mut bytes, 2 + 4 * body.lines.len() as u32);
                        write_u16(&mut bytes, body.lines.len() as u16);
                        for (start_pc, line) in &body.lines {
                            write_u16(&mut bytes, *start_pc);
                            write_u16(&mut bytes, *line);
                        }
                    }
                }
                None => {
                    write_u16(&mut bytes, 0);
                }
            }
        }
        match self.source_file {
            Some(index) => {
                write_u16(&mut bytes, 1);
                write_u16(&mut bytes, self.source_file_index);
                write_u32(&mut bytes, 2);
                write_u16(&mut bytes, index);
            }
            None => write_u16(&mut bytes, 0),
        }
        bytes
    }
}

/// Method definition for generated class files.
struct MethodSpec {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
    body: Option<MethodBody>,
}

struct MethodBody {
    code: Vec<u8>,
    lines: Vec<(u16, u16)>,
}

/// Constant pool entries needed by fixture class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    MethodRef(u16, u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::String(value_index) => {
                bytes.push(8);
                write_u16(bytes, *value_index);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::MethodRef(class_index, name_and_type) => {
                bytes.push(10);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
        }
    }
}

pub(crate) fn high(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn low(value: u16) -> u8 {
    (value & 0xff) as u8
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}
