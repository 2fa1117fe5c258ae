//! Android 二进制 XML（编译后的 `AndroidManifest.xml`）的最小读取器。
//!
//! 只解码字符串池与起始元素的属性，其余 chunk 一律跳过。

use thiserror::Error;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const STRING_POOL_HEADER_SIZE: usize = 28;
const UTF8_FLAG: u32 = 1 << 8;
const NO_ENTRY: u32 = 0xFFFF_FFFF;

const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

#[derive(Debug, Error)]
pub enum AxmlError {
    #[error("not a binary xml document")]
    NotBinaryXml,
    #[error("truncated chunk at offset {0}")]
    Truncated(usize),
    #[error("string index {0} out of range")]
    BadStringIndex(u32),
    #[error("start element seen before string pool")]
    MissingStringPool,
    #[error("malformed string pool at offset {0}")]
    MalformedStringPool(usize),
}

/// 解码后的属性值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    String(String),
    Reference(u32),
    Int(i64),
    Bool(bool),
    Other { data_type: u8, data: u32 },
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartElement {
    pub name: String,
    pub attributes: Vec<Attribute>,
}

impl StartElement {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| &attribute.value)
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&self, offset: usize) -> Result<u8, AxmlError> {
        self.data
            .get(offset)
            .copied()
            .ok_or(AxmlError::Truncated(offset))
    }

    fn u16(&self, offset: usize) -> Result<u16, AxmlError> {
        let bytes = self
            .data
            .get(offset..offset + 2)
            .ok_or(AxmlError::Truncated(offset))?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32, AxmlError> {
        let bytes = self
            .data
            .get(offset..offset + 4)
            .ok_or(AxmlError::Truncated(offset))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], AxmlError> {
        self.data
            .get(offset..offset + len)
            .ok_or(AxmlError::Truncated(offset))
    }
}

/// 按文档顺序返回全部起始元素。
pub fn start_elements(data: &[u8]) -> Result<Vec<StartElement>, AxmlError> {
    let reader = Reader { data };
    if reader.u16(0)? != RES_XML_TYPE {
        return Err(AxmlError::NotBinaryXml);
    }
    let header_size = reader.u16(2)? as usize;
    let document_size = (reader.u32(4)? as usize).min(data.len());

    let mut strings: Option<Vec<String>> = None;
    let mut elements = Vec::new();
    let mut offset = header_size;

    while offset + 8 <= document_size {
        let chunk_type = reader.u16(offset)?;
        let chunk_header_size = reader.u16(offset + 2)? as usize;
        let chunk_size = reader.u32(offset + 4)? as usize;
        if chunk_size < 8 || offset + chunk_size > data.len() {
            return Err(AxmlError::Truncated(offset));
        }

        match chunk_type {
            RES_STRING_POOL_TYPE => {
                strings = Some(read_string_pool(&reader, offset, chunk_size)?);
            }
            RES_XML_START_ELEMENT_TYPE => {
                let pool = strings.as_deref().ok_or(AxmlError::MissingStringPool)?;
                elements.push(read_start_element(
                    &reader,
                    offset,
                    chunk_header_size,
                    pool,
                )?);
            }
            _ => {}
        }

        offset += chunk_size;
    }

    Ok(elements)
}

fn read_string_pool(
    reader: &Reader<'_>,
    chunk: usize,
    chunk_size: usize,
) -> Result<Vec<String>, AxmlError> {
    let string_count = reader.u32(chunk + 8)? as usize;
    let flags = reader.u32(chunk + 16)?;
    let strings_start = reader.u32(chunk + 20)? as usize;
    let header_size = reader.u16(chunk + 2)? as usize;
    let utf8 = flags & UTF8_FLAG != 0;

    // 偏移表必须完整落在 chunk 内，计数不可信
    if header_size < STRING_POOL_HEADER_SIZE
        || header_size > chunk_size
        || string_count > (chunk_size - header_size) / 4
        || strings_start > chunk_size
    {
        return Err(AxmlError::MalformedStringPool(chunk));
    }

    let mut strings = Vec::with_capacity(string_count);
    for index in 0..string_count {
        let string_offset = reader.u32(chunk + header_size + index * 4)? as usize;
        let position = chunk + strings_start + string_offset;
        let value = if utf8 {
            read_utf8_string(reader, position)?
        } else {
            read_utf16_string(reader, position)?
        };
        strings.push(value);
    }
    Ok(strings)
}

fn read_utf8_string(reader: &Reader<'_>, mut position: usize) -> Result<String, AxmlError> {
    // 先是 utf-16 长度，再是 utf-8 字节长度，各占一到两个字节
    let (_, consumed) = read_utf8_length(reader, position)?;
    position += consumed;
    let (byte_len, consumed) = read_utf8_length(reader, position)?;
    position += consumed;
    let bytes = reader.slice(position, byte_len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_utf8_length(reader: &Reader<'_>, position: usize) -> Result<(usize, usize), AxmlError> {
    let first = reader.u8(position)? as usize;
    if first & 0x80 != 0 {
        let second = reader.u8(position + 1)? as usize;
        Ok((((first & 0x7F) << 8) | second, 2))
    } else {
        Ok((first, 1))
    }
}

fn read_utf16_string(reader: &Reader<'_>, mut position: usize) -> Result<String, AxmlError> {
    let first = reader.u16(position)? as usize;
    position += 2;
    let char_len = if first & 0x8000 != 0 {
        let second = reader.u16(position)? as usize;
        position += 2;
        ((first & 0x7FFF) << 16) | second
    } else {
        first
    };

    if position + char_len * 2 > reader.data.len() {
        return Err(AxmlError::Truncated(position));
    }
    let units = (0..char_len)
        .map(|index| reader.u16(position + index * 2))
        .collect::<Result<Vec<u16>, AxmlError>>()?;
    Ok(String::from_utf16_lossy(&units))
}

fn read_start_element(
    reader: &Reader<'_>,
    chunk: usize,
    header_size: usize,
    strings: &[String],
) -> Result<StartElement, AxmlError> {
    let ext = chunk + header_size;
    let name = lookup(strings, reader.u32(ext + 4)?)?;
    let attribute_start = reader.u16(ext + 8)? as usize;
    let attribute_size = reader.u16(ext + 10)? as usize;
    let attribute_count = reader.u16(ext + 12)? as usize;

    let mut attributes = Vec::with_capacity(attribute_count);
    for index in 0..attribute_count {
        let attr = ext + attribute_start + index * attribute_size;
        let name_index = reader.u32(attr + 4)?;
        let raw_value = reader.u32(attr + 8)?;
        let data_type = reader.u8(attr + 15)?;
        let data = reader.u32(attr + 16)?;

        let name = lookup(strings, name_index)?;
        let value = if raw_value != NO_ENTRY {
            AttributeValue::String(lookup(strings, raw_value)?)
        } else {
            match data_type {
                TYPE_STRING => AttributeValue::String(lookup(strings, data)?),
                TYPE_REFERENCE => AttributeValue::Reference(data),
                TYPE_INT_DEC | TYPE_INT_HEX => AttributeValue::Int(data as i32 as i64),
                TYPE_INT_BOOLEAN => AttributeValue::Bool(data != 0),
                _ => AttributeValue::Other { data_type, data },
            }
        };
        attributes.push(Attribute { name, value });
    }

    Ok(StartElement { name, attributes })
}

fn lookup(strings: &[String], index: u32) -> Result<String, AxmlError> {
    if index == NO_ENTRY {
        return Ok(String::new());
    }
    strings
        .get(index as usize)
        .cloned()
        .ok_or(AxmlError::BadStringIndex(index))
}

/// 构造测试用的小型二进制 XML 文档。
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub enum TestValue<'a> {
        Str(&'a str),
        Int(i32),
        Reference(u32),
    }

    pub struct TestElement<'a> {
        pub name: &'a str,
        pub attributes: Vec<(&'a str, TestValue<'a>)>,
    }

    pub fn encode(elements: &[TestElement<'_>]) -> Vec<u8> {
        let mut strings: Vec<String> = Vec::new();
        let mut intern = |value: &str| -> u32 {
            if let Some(position) = strings.iter().position(|s| s == value) {
                return position as u32;
            }
            strings.push(value.to_string());
            (strings.len() - 1) as u32
        };

        let mut body = Vec::new();
        for element in elements {
            let name = intern(element.name);
            let mut attrs = Vec::new();
            for (attr_name, value) in &element.attributes {
                let attr_name = intern(attr_name);
                let (raw, data_type, data) = match value {
                    TestValue::Str(text) => {
                        let index = intern(text);
                        (index, TYPE_STRING, index)
                    }
                    TestValue::Int(number) => (NO_ENTRY, TYPE_INT_DEC, *number as u32),
                    TestValue::Reference(id) => (NO_ENTRY, TYPE_REFERENCE, *id),
                };
                attrs.extend_from_slice(&NO_ENTRY.to_le_bytes());
                attrs.extend_from_slice(&attr_name.to_le_bytes());
                attrs.extend_from_slice(&raw.to_le_bytes());
                attrs.extend_from_slice(&8u16.to_le_bytes());
                attrs.push(0);
                attrs.push(data_type);
                attrs.extend_from_slice(&data.to_le_bytes());
            }

            let chunk_size = 16 + 20 + attrs.len();
            body.extend_from_slice(&RES_XML_START_ELEMENT_TYPE.to_le_bytes());
            body.extend_from_slice(&16u16.to_le_bytes());
            body.extend_from_slice(&(chunk_size as u32).to_le_bytes());
            body.extend_from_slice(&1u32.to_le_bytes());
            body.extend_from_slice(&NO_ENTRY.to_le_bytes());
            body.extend_from_slice(&NO_ENTRY.to_le_bytes());
            body.extend_from_slice(&name.to_le_bytes());
            body.extend_from_slice(&20u16.to_le_bytes());
            body.extend_from_slice(&20u16.to_le_bytes());
            body.extend_from_slice(&(element.attributes.len() as u16).to_le_bytes());
            body.extend_from_slice(&[0u8; 6]);
            body.extend_from_slice(&attrs);
        }

        let mut string_data = Vec::new();
        let mut offsets = Vec::new();
        for value in &strings {
            offsets.push(string_data.len() as u32);
            let units: Vec<u16> = value.encode_utf16().collect();
            string_data.extend_from_slice(&(units.len() as u16).to_le_bytes());
            for unit in units {
                string_data.extend_from_slice(&unit.to_le_bytes());
            }
            string_data.extend_from_slice(&0u16.to_le_bytes());
        }
        while string_data.len() % 4 != 0 {
            string_data.push(0);
        }

        let pool_header = 28;
        let strings_start = pool_header + offsets.len() * 4;
        let pool_size = strings_start + string_data.len();
        let mut pool = Vec::new();
        pool.extend_from_slice(&RES_STRING_POOL_TYPE.to_le_bytes());
        pool.extend_from_slice(&(pool_header as u16).to_le_bytes());
        pool.extend_from_slice(&(pool_size as u32).to_le_bytes());
        pool.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
        pool.extend_from_slice(&0u32.to_le_bytes());
        pool.extend_from_slice(&0u32.to_le_bytes());
        pool.extend_from_slice(&(strings_start as u32).to_le_bytes());
        pool.extend_from_slice(&0u32.to_le_bytes());
        for offset in offsets {
            pool.extend_from_slice(&offset.to_le_bytes());
        }
        pool.extend_from_slice(&string_data);

        let total = 8 + pool.len() + body.len();
        let mut document = Vec::with_capacity(total);
        document.extend_from_slice(&RES_XML_TYPE.to_le_bytes());
        document.extend_from_slice(&8u16.to_le_bytes());
        document.extend_from_slice(&(total as u32).to_le_bytes());
        document.extend_from_slice(&pool);
        document.extend_from_slice(&body);
        document
    }
}
