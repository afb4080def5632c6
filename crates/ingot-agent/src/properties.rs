use std::path::Path;

use crate::error::SupervisorError;

pub const PROPERTIES_FILE: &str = "server.properties";

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let (k, v) = trimmed.split_once('=')?;
    Some((k.trim(), v.trim()))
}

/// Looks up a single key, ignoring comments.
pub fn get_value(input: &str, key: &str) -> Option<String> {
    input
        .lines()
        .filter_map(parse_line)
        .filter(|(k, _)| *k == key)
        .last()
        .map(|(_, v)| v.to_string())
}

/// Rewrites `updates` keys in place and appends the ones that were missing,
/// in the order given. Every other line is kept verbatim.
pub fn merge(input: &str, updates: &[(String, String)]) -> String {
    let mut written = vec![false; updates.len()];
    let mut out = String::with_capacity(input.len() + 64);

    for line in input.lines() {
        let idx = parse_line(line).and_then(|(k, _)| updates.iter().position(|(uk, _)| uk == k));
        match idx {
            Some(i) if !written[i] => {
                let (k, v) = &updates[i];
                out.push_str(&format!("{k}={v}\n"));
                written[i] = true;
            }
            // Duplicate managed key further down: drop it so the file has one value.
            Some(_) => {}
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (i, (k, v)) in updates.iter().enumerate() {
        if !written[i] {
            out.push_str(&format!("{k}={v}\n"));
        }
    }
    out
}

pub fn rcon_updates(port: u16, password: &str) -> Vec<(String, String)> {
    vec![
        ("enable-rcon".to_string(), "true".to_string()),
        ("rcon.port".to_string(), port.to_string()),
        ("rcon.password".to_string(), password.to_string()),
    ]
}

/// Writes RCON keys (when configured) plus `extra_keys` into the properties
/// file at `path`, creating it if needed.
pub fn apply_rcon(
    path: &Path,
    rcon: Option<(u16, &str)>,
    extra_keys: &[(String, String)],
) -> Result<(), SupervisorError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(SupervisorError::fs(format!("read {}", path.display()), e)),
    };

    let mut updates = match rcon {
        Some((port, password)) => rcon_updates(port, password),
        None => Vec::new(),
    };
    updates.extend(extra_keys.iter().cloned());

    let out = merge(&existing, &updates);
    if out == existing {
        return Ok(());
    }

    let tmp = path.with_extension("properties.tmp");
    std::fs::write(&tmp, out.as_bytes())
        .map_err(|e| SupervisorError::fs(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| SupervisorError::fs(format!("persist {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::tests::temp_dir_for;

    fn keys(s: &str) -> Vec<String> {
        s.lines()
            .filter_map(parse_line)
            .map(|(k, _)| k.to_string())
            .collect()
    }

    #[test]
    fn rcon_update_touches_only_rcon_keys() {
        let root = temp_dir_for("props-rcon");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join(PROPERTIES_FILE);
        std::fs::write(&path, "a=1\nb=2\n").unwrap();

        apply_rcon(&path, Some((5555, "s3cr3t")), &[]).unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            out,
            "a=1\nb=2\nenable-rcon=true\nrcon.port=5555\nrcon.password=s3cr3t\n"
        );
        assert_eq!(
            keys(&out),
            vec!["a", "b", "enable-rcon", "rcon.port", "rcon.password"]
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn managed_keys_are_replaced_in_place() {
        let input = "# Minecraft server properties\nrcon.port=1\nmotd=hi there\nserver-port=25565\n\nenable-rcon=false\n";
        let mut updates = rcon_updates(25575, "pw");
        updates.push(("server-port".to_string(), "25570".to_string()));

        let out = merge(input, &updates);
        assert_eq!(
            out,
            "# Minecraft server properties\nrcon.port=25575\nmotd=hi there\nserver-port=25570\n\nenable-rcon=true\nrcon.password=pw\n"
        );
    }

    #[test]
    fn duplicate_managed_keys_collapse_to_one() {
        let out = merge(
            "server-port=1\nx=y\nserver-port=2\n",
            &[("server-port".to_string(), "3".to_string())],
        );
        assert_eq!(out, "server-port=3\nx=y\n");
    }

    #[test]
    fn commented_keys_are_not_managed() {
        let out = merge(
            "#rcon.port=1\n",
            &[("rcon.port".to_string(), "2".to_string())],
        );
        assert_eq!(out, "#rcon.port=1\nrcon.port=2\n");
    }

    #[test]
    fn no_rcon_leaves_rcon_keys_alone() {
        let root = temp_dir_for("props-none");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join(PROPERTIES_FILE);
        std::fs::write(&path, "enable-rcon=true\nrcon.port=9\n").unwrap();

        apply_rcon(&path, None, &[("server-port".to_string(), "25566".to_string())]).unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        assert_eq!(out, "enable-rcon=true\nrcon.port=9\nserver-port=25566\n");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn get_value_reads_last_uncommented_entry() {
        let input = "#server-port=1\nserver-port = 25570\n";
        assert_eq!(get_value(input, "server-port").as_deref(), Some("25570"));
        assert_eq!(get_value(input, "missing"), None);
    }
}
