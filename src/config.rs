//! Config ingestion: turn the parsed YAML document into the object model.
//!
//! The config arrives as a parsed `serde_yaml::Value` rather than a typed
//! struct because cnode sections mix integer slot keys with the `size` and
//! `guard` fields, and because section and key order is semantic (vspace
//! nonces, operation insertion order). Every cross-reference is validated
//! here; later stages may assume the model is closed.

use serde_yaml::{Mapping, Value};

use crate::cap::{CNode, CapKind, CapModification, CapRight, GpUntypedRange};
use crate::context::Context;
use crate::elf::ElfImage;
use crate::error::{ConfigError, Error};
use crate::thread::Thread;
use crate::vspace::VSpace;
use indexmap::IndexMap;

pub fn ingest(ctx: &mut Context, doc: &Value) -> Result<(), Error> {
    let root = doc.as_mapping().ok_or(ConfigError::Malformed {
        section: "config",
        reason: "top level is not a mapping".to_string(),
    })?;

    ingest_caps(ctx, section(root, "caps")?)?;
    ingest_cap_modifications(ctx, section(root, "cap_modifications")?)?;
    ingest_cnodes(ctx, section(root, "cnodes")?)?;
    ingest_gp_untypeds_cnode(ctx, root)?;
    ingest_vspaces(ctx, section(root, "vspaces")?)?;
    ingest_threads(ctx, section(root, "threads")?)?;

    log::debug!(
        "ingested {} caps across {} cnodes, {} vspaces, {} threads",
        ctx.cap_table.slots_required() - 1,
        ctx.cnodes.len(),
        ctx.vspaces.len(),
        ctx.threads.len()
    );
    Ok(())
}

/// A missing section is the same as an empty one.
fn section<'a>(
    root: &'a Mapping,
    name: &'static str,
) -> Result<Option<&'a Mapping>, ConfigError> {
    match lookup(root, name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_mapping()
            .map(Some)
            .ok_or(ConfigError::Malformed {
                section: name,
                reason: "section is not a mapping".to_string(),
            }),
    }
}

fn lookup<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(&Value::String(key.to_string()))
}

fn key_as_str<'a>(key: &'a Value, section: &'static str) -> Result<&'a str, ConfigError> {
    key.as_str().ok_or_else(|| ConfigError::Malformed {
        section,
        reason: format!("expected a string key, found {:?}", key),
    })
}

fn value_as_str<'a>(
    value: &'a Value,
    section: &'static str,
    what: &str,
) -> Result<&'a str, ConfigError> {
    value.as_str().ok_or_else(|| ConfigError::Malformed {
        section,
        reason: format!("expected '{}' to be a string", what),
    })
}

fn value_as_u64(value: &Value, section: &'static str, what: &str) -> Result<u64, ConfigError> {
    value.as_u64().ok_or_else(|| ConfigError::Malformed {
        section,
        reason: format!("expected '{}' to be a non-negative integer", what),
    })
}

fn string_list(
    value: &Value,
    section: &'static str,
    what: &str,
) -> Result<Vec<String>, ConfigError> {
    let seq = value.as_sequence().ok_or_else(|| ConfigError::Malformed {
        section,
        reason: format!("expected '{}' to be a list", what),
    })?;
    seq.iter()
        .map(|item| Ok(value_as_str(item, section, what)?.to_string()))
        .collect()
}

fn ingest_caps(ctx: &mut Context, caps: Option<&Mapping>) -> Result<(), Error> {
    for (key, value) in caps.into_iter().flatten() {
        let name = key_as_str(key, "caps")?;
        let kind_name = value_as_str(value, "caps", name)?;
        let kind =
            CapKind::from_config_name(kind_name).ok_or_else(|| ConfigError::UnknownCapKind {
                name: name.to_string(),
                kind: kind_name.to_string(),
            })?;
        // CNodes carry geometry and slot contents; they are declared in
        // their own section.
        if kind == CapKind::CNode {
            return Err(ConfigError::NestedCNode(name.to_string()).into());
        }
        ctx.cap_table.append(name, kind)?;
        ctx.initial_caps.push(name.to_string());
    }
    Ok(())
}

fn ingest_cap_modifications(ctx: &mut Context, mods: Option<&Mapping>) -> Result<(), Error> {
    for (key, value) in mods.into_iter().flatten() {
        let dest_name = key_as_str(key, "cap_modifications")?;
        let body = value.as_mapping().ok_or(ConfigError::Malformed {
            section: "cap_modifications",
            reason: format!("modification '{}' is not a mapping", dest_name),
        })?;

        let src_name = value_as_str(
            body.get(&Value::String("original".into()))
                .ok_or(ConfigError::Malformed {
                    section: "cap_modifications",
                    reason: format!("modification '{}' has no 'original'", dest_name),
                })?,
            "cap_modifications",
            "original",
        )?;
        let src = ctx
            .cap_table
            .get(src_name)
            .ok_or_else(|| ConfigError::UnknownReference {
                referrer: dest_name.to_string(),
                name: src_name.to_string(),
            })?;
        if !src.kind.derivable() {
            return Err(ConfigError::UnderivableSource {
                dest: dest_name.to_string(),
                src: src_name.to_string(),
            }
            .into());
        }
        let src_kind = src.kind;

        let rights_value = body
            .get(&Value::String("rights".into()))
            .ok_or(ConfigError::Malformed {
                section: "cap_modifications",
                reason: format!("modification '{}' has no 'rights'", dest_name),
            })?;
        let mut rights = Vec::new();
        for name in string_list(rights_value, "cap_modifications", "rights")? {
            rights.push(
                CapRight::from_config_name(&name).ok_or(ConfigError::Malformed {
                    section: "cap_modifications",
                    reason: format!("unknown right '{}' on '{}'", name, dest_name),
                })?,
            );
        }

        let badge = match body.get(&Value::String("badge".into())) {
            Some(value) => value_as_u64(value, "cap_modifications", "badge")?,
            None => 0,
        };

        ctx.cap_table.append(dest_name, src_kind)?;
        ctx.cap_modifications.insert(
            dest_name.to_string(),
            CapModification {
                dest: dest_name.to_string(),
                src: src_name.to_string(),
                rights,
                badge,
            },
        );
    }
    Ok(())
}

/// A CNode bit count; anything at or past the word size is nonsense.
fn bits_field(value: &Value, cnode: &str, what: &str) -> Result<u8, ConfigError> {
    let bits = value_as_u64(value, "cnodes", what)?;
    if bits >= 64 {
        return Err(ConfigError::Malformed {
            section: "cnodes",
            reason: format!("'{}' of cnode '{}' is out of range: {}", what, cnode, bits),
        });
    }
    Ok(bits as u8)
}

fn ingest_cnodes(ctx: &mut Context, cnodes: Option<&Mapping>) -> Result<(), Error> {
    for (key, value) in cnodes.into_iter().flatten() {
        let name = key_as_str(key, "cnodes")?;
        let body = value.as_mapping().ok_or(ConfigError::Malformed {
            section: "cnodes",
            reason: format!("cnode '{}' is not a mapping", name),
        })?;

        let mut size_bits = None;
        let mut guard_bits = None;
        let mut slots: IndexMap<u64, String> = IndexMap::new();
        for (field, field_value) in body {
            match field {
                Value::String(s) if s == "size" => {
                    size_bits = Some(bits_field(field_value, name, "size")?);
                }
                Value::String(s) if s == "guard" => {
                    guard_bits = Some(bits_field(field_value, name, "guard")?);
                }
                Value::Number(_) => {
                    let slot = value_as_u64(field, "cnodes", "slot index")?;
                    let cap_name = value_as_str(field_value, "cnodes", "slot contents")?;
                    if !ctx.cap_table.contains(cap_name) {
                        return Err(ConfigError::UnknownReference {
                            referrer: name.to_string(),
                            name: cap_name.to_string(),
                        }
                        .into());
                    }
                    slots.insert(slot, cap_name.to_string());
                }
                other => {
                    return Err(ConfigError::Malformed {
                        section: "cnodes",
                        reason: format!("unexpected key {:?} in cnode '{}'", other, name),
                    }
                    .into())
                }
            }
        }

        let size_bits = size_bits.ok_or(ConfigError::Malformed {
            section: "cnodes",
            reason: format!("cnode '{}' has no 'size'", name),
        })?;
        let guard_bits = guard_bits.ok_or(ConfigError::Malformed {
            section: "cnodes",
            reason: format!("cnode '{}' has no 'guard'", name),
        })?;
        for slot in slots.keys() {
            if *slot >= 1 << size_bits {
                return Err(ConfigError::SlotOutOfRange {
                    cnode: name.to_string(),
                    slot: *slot,
                    size_bits,
                }
                .into());
            }
        }

        ctx.cap_table.append(name, CapKind::CNode)?;
        ctx.cnodes.insert(
            name.to_string(),
            CNode {
                name: name.to_string(),
                size_bits,
                guard_bits,
                slots,
                gp_untypeds: None,
            },
        );
    }
    Ok(())
}

fn ingest_gp_untypeds_cnode(ctx: &mut Context, root: &Mapping) -> Result<(), Error> {
    let value = match lookup(root, "gp_untypeds_cnode") {
        None | Some(Value::Null) => return Ok(()),
        Some(value) => value,
    };
    let body = value.as_mapping().ok_or(ConfigError::Malformed {
        section: "gp_untypeds_cnode",
        reason: "section is not a mapping".to_string(),
    })?;
    let cnode_name = value_as_str(
        body.get(&Value::String("cnode".into()))
            .ok_or(ConfigError::Malformed {
                section: "gp_untypeds_cnode",
                reason: "missing 'cnode'".to_string(),
            })?,
        "gp_untypeds_cnode",
        "cnode",
    )?;
    let start_slot = value_as_u64(
        body.get(&Value::String("start_slot".into()))
            .ok_or(ConfigError::Malformed {
                section: "gp_untypeds_cnode",
                reason: "missing 'start_slot'".to_string(),
            })?,
        "gp_untypeds_cnode",
        "start_slot",
    )?;
    let end_slot = value_as_u64(
        body.get(&Value::String("end_slot".into()))
            .ok_or(ConfigError::Malformed {
                section: "gp_untypeds_cnode",
                reason: "missing 'end_slot'".to_string(),
            })?,
        "gp_untypeds_cnode",
        "end_slot",
    )?;

    let cnode = ctx
        .cnodes
        .get_mut(cnode_name)
        .ok_or_else(|| ConfigError::UnknownReference {
            referrer: "gp_untypeds_cnode".to_string(),
            name: cnode_name.to_string(),
        })?;
    cnode.gp_untypeds = Some(GpUntypedRange {
        start_slot,
        end_slot,
    });
    ctx.gp_untypeds_cnode = Some(cnode_name.to_string());
    Ok(())
}

fn ingest_vspaces(ctx: &mut Context, vspaces: Option<&Mapping>) -> Result<(), Error> {
    for (nonce, (key, value)) in vspaces.into_iter().flatten().enumerate() {
        let name = key_as_str(key, "vspaces")?;
        let binary_name = value_as_str(value, "vspaces", name)?;
        let path = ctx.startup_threads_paths.get(binary_name).ok_or_else(|| {
            ConfigError::UnknownReference {
                referrer: name.to_string(),
                name: binary_name.to_string(),
            }
        })?;
        let image = ElfImage::open(path)?;
        ctx.cap_table.append(name, CapKind::VSpace)?;
        let vspace = VSpace::new(name, binary_name, nonce, image, ctx.page_size)?;
        ctx.vspaces.insert(name.to_string(), vspace);
    }
    Ok(())
}

fn ingest_threads(ctx: &mut Context, threads: Option<&Mapping>) -> Result<(), Error> {
    for (key, value) in threads.into_iter().flatten() {
        let name = key_as_str(key, "threads")?;
        let body = value.as_mapping().ok_or(ConfigError::Malformed {
            section: "threads",
            reason: format!("thread '{}' is not a mapping", name),
        })?;

        // The tcb must already exist from the caps section.
        let tcb = ctx
            .cap_table
            .get(name)
            .ok_or_else(|| ConfigError::UnknownReference {
                referrer: "threads".to_string(),
                name: name.to_string(),
            })?;
        if tcb.kind != CapKind::Tcb {
            return Err(ConfigError::WrongKind {
                name: name.to_string(),
                expected: "tcb",
            }
            .into());
        }
        if ctx.threads.contains_key(name) {
            return Err(ConfigError::DuplicateName(name.to_string()).into());
        }

        let cspace_name = value_as_str(
            body.get(&Value::String("cspace".into()))
                .ok_or(ConfigError::Malformed {
                    section: "threads",
                    reason: format!("thread '{}' has no 'cspace'", name),
                })?,
            "threads",
            "cspace",
        )?;
        if !ctx.cnodes.contains_key(cspace_name) {
            return Err(ConfigError::WrongKind {
                name: cspace_name.to_string(),
                expected: "cnode",
            }
            .into());
        }

        let vspace_name = value_as_str(
            body.get(&Value::String("vspace".into()))
                .ok_or(ConfigError::Malformed {
                    section: "threads",
                    reason: format!("thread '{}' has no 'vspace'", name),
                })?,
            "threads",
            "vspace",
        )?;
        if !ctx.vspaces.contains_key(vspace_name) {
            return Err(ConfigError::UnknownReference {
                referrer: name.to_string(),
                name: vspace_name.to_string(),
            }
            .into());
        }

        let ipc_buffer_name = value_as_str(
            body.get(&Value::String("ipc_buffer".into()))
                .ok_or(ConfigError::Malformed {
                    section: "threads",
                    reason: format!("thread '{}' has no 'ipc_buffer'", name),
                })?,
            "threads",
            "ipc_buffer",
        )?;
        match ctx.cap_table.get(ipc_buffer_name) {
            Some(cap) if cap.kind == CapKind::Frame => (),
            Some(_) => {
                return Err(ConfigError::WrongKind {
                    name: ipc_buffer_name.to_string(),
                    expected: "frame",
                }
                .into())
            }
            None => {
                return Err(ConfigError::UnknownReference {
                    referrer: name.to_string(),
                    name: ipc_buffer_name.to_string(),
                }
                .into())
            }
        }

        let stack_size = body
            .get(&Value::String("stack_size".into()))
            .ok_or(ConfigError::Malformed {
                section: "threads",
                reason: format!("thread '{}' has no 'stack_size'", name),
            })?
            .as_u64()
            .ok_or(ConfigError::BadStackSize {
                thread: name.to_string(),
            })?;

        let vspace = &ctx.vspaces[vspace_name];
        let entry_addr = match body.get(&Value::String("entry".into())) {
            Some(value) => {
                let symbol = value_as_str(value, "threads", "entry")?;
                vspace
                    .symbol(symbol)?
                    .ok_or(ConfigError::EntrySymbolNotFound {
                        thread: name.to_string(),
                        symbol: symbol.to_string(),
                    })?
            }
            None => vspace.entry_point()?,
        };

        let args = match body.get(&Value::String("args".into())) {
            Some(value) => string_list(value, "threads", "args")?,
            None => Vec::new(),
        };
        let envps = match body.get(&Value::String("envps".into())) {
            Some(value) => string_list(value, "threads", "envps")?,
            None => Vec::new(),
        };

        ctx.threads.insert(
            name.to_string(),
            Thread {
                name: name.to_string(),
                cspace: cspace_name.to_string(),
                vspace: vspace_name.to_string(),
                ipc_buffer: ipc_buffer_name.to_string(),
                stack_size,
                entry_addr,
                args,
                envps,
                ipc_buffer_addr: 0,
                stack_top_addr: 0,
                stack_pointer_addr: 0,
                arg0: 0,
                arg1: 0,
                arg2: 0,
            },
        );
    }
    Ok(())
}
