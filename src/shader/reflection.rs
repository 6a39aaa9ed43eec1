//! Minimal SPIR-V reflection.
//!
//! Walks the raw instruction stream for the decorations the binding model
//! needs: descriptor set / binding pairs, debug names and the compute
//! workgroup size. No type graph is built.

use fxhash::FxHashMap;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

const OP_NAME: u16 = 5;
const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_DECORATE: u16 = 71;

const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ReflectionData {
    pub entry_point: Option<String>,
    pub workgroup_size: (u32, u32, u32),
    /// Sorted by `(set, binding)`.
    pub bindings: Vec<BindingInfo>,
}

fn read_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    'outer: for word in words {
        for byte in word.to_le_bytes().iter() {
            if *byte == 0 {
                break 'outer;
            }
            bytes.push(*byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn reflect_spirv(spirv: &[u32]) -> ReflectionData {
    let mut data = ReflectionData::default();
    if spirv.len() < HEADER_WORDS || spirv[0] != SPIRV_MAGIC {
        return data;
    }

    let mut names: FxHashMap<u32, String> = FxHashMap::default();
    let mut sets: FxHashMap<u32, u32> = FxHashMap::default();
    let mut bindings: FxHashMap<u32, u32> = FxHashMap::default();

    let mut cursor = HEADER_WORDS;
    while cursor < spirv.len() {
        let word = spirv[cursor];
        let word_count = (word >> 16) as usize;
        let opcode = (word & 0xffff) as u16;
        if word_count == 0 || cursor + word_count > spirv.len() {
            break;
        }
        let operands = &spirv[cursor + 1..cursor + word_count];

        match opcode {
            OP_NAME if operands.len() >= 2 => {
                names.insert(operands[0], read_string(&operands[1..]));
            }
            OP_ENTRY_POINT if operands.len() >= 3 => {
                data.entry_point = Some(read_string(&operands[2..]));
            }
            OP_EXECUTION_MODE
                if operands.len() >= 5 && operands[1] == EXECUTION_MODE_LOCAL_SIZE =>
            {
                data.workgroup_size = (operands[2], operands[3], operands[4]);
            }
            OP_DECORATE if operands.len() >= 3 => match operands[1] {
                DECORATION_DESCRIPTOR_SET => {
                    sets.insert(operands[0], operands[2]);
                }
                DECORATION_BINDING => {
                    bindings.insert(operands[0], operands[2]);
                }
                _ => {}
            },
            _ => {}
        }
        cursor += word_count;
    }

    for (id, binding) in bindings {
        data.bindings.push(BindingInfo {
            set: sets.get(&id).copied().unwrap_or(0),
            binding,
            name: names.get(&id).cloned().filter(|n| !n.is_empty()),
        });
    }
    data.bindings.sort_by_key(|b| (b.set, b.binding));
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(opcode: u16, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode as u32];
        words.extend_from_slice(operands);
        words
    }

    fn string_words(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn module(instructions: &[Vec<u32>]) -> Vec<u32> {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 100, 0];
        for i in instructions {
            words.extend_from_slice(i);
        }
        words
    }

    #[test]
    fn extracts_bindings_and_workgroup_size() {
        let mut name_op = vec![7u32];
        name_op.extend(string_words("result"));

        let mut entry = vec![5 /* GLCompute */, 1];
        entry.extend(string_words("main"));

        let spirv = module(&[
            inst(OP_ENTRY_POINT, &entry),
            inst(OP_EXECUTION_MODE, &[1, EXECUTION_MODE_LOCAL_SIZE, 64, 1, 1]),
            inst(OP_NAME, &name_op),
            inst(OP_DECORATE, &[7, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[7, DECORATION_BINDING, 96]),
            inst(OP_DECORATE, &[9, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[9, DECORATION_BINDING, 32]),
        ]);

        let data = reflect_spirv(&spirv);
        assert_eq!(data.entry_point.as_deref(), Some("main"));
        assert_eq!(data.workgroup_size, (64, 1, 1));
        assert_eq!(data.bindings.len(), 2);
        assert_eq!(data.bindings[0].binding, 32);
        assert_eq!(data.bindings[1].binding, 96);
        assert_eq!(data.bindings[1].name.as_deref(), Some("result"));
    }

    #[test]
    fn rejects_non_spirv() {
        assert!(reflect_spirv(&[1, 2, 3]).bindings.is_empty());
        assert!(reflect_spirv(&[]).bindings.is_empty());
    }
}
