//! On-disk persistence for the binding table.
//!
//! The format is one binding per line, `<v6> <v4> <last-use-epoch>`,
//! written to a temporary file in the same directory and renamed over the
//! target so readers never observe a partial table.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::pool::Ipv4Pool;

/// Write all live bindings to `path` atomically.
pub fn save(pool: &Ipv4Pool, path: &Path) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for (v6, v4, last_use) in pool.bindings() {
            writeln!(out, "{v6} {v4} {last_use}")?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Reload bindings from `path` into `pool`. A missing file is an empty
/// table; lines that do not parse (or that no longer fit the configured
/// pool) are skipped with a warning. Returns the number of bindings
/// loaded.
pub fn load(pool: &mut Ipv4Pool, path: &Path) -> io::Result<usize> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut loaded = 0;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let v6 = fields.next()?.parse().ok()?;
            let v4 = fields.next()?.parse().ok()?;
            let last_use = fields.next()?.parse().ok()?;
            fields.next().is_none().then_some((v6, v4, last_use))
        })();
        let Some((v6, v4, last_use)) = parsed else {
            log::warn!(
                "Ignoring unparseable line {} in {}",
                lineno + 1,
                path.display()
            );
            continue;
        };
        match pool.insert(v6, v4, last_use) {
            Ok(()) => loaded += 1,
            Err(err) => log::warn!(
                "Ignoring saved binding {v6} {v4} on line {}: {err}",
                lineno + 1
            ),
        }
    }
    // The reload itself is not a change worth rewriting the file for.
    pool.take_dirty();
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pool() -> Ipv4Pool {
        Ipv4Pool::new("203.0.113.0/28".parse().unwrap(), 7200)
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic.map");

        let mut original = pool();
        for i in 1..=4u32 {
            original
                .get_or_assign(std::net::Ipv6Addr::from(0xfd00u128 << 112 | u128::from(i)), 1000 + u64::from(i))
                .unwrap();
        }
        save(&original, &path).unwrap();

        let mut reloaded = pool();
        assert_eq!(load(&mut reloaded, &path).unwrap(), 4);

        let set = |p: &Ipv4Pool| p.bindings().collect::<BTreeSet<_>>();
        assert_eq!(set(&original), set(&reloaded));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = pool();
        assert_eq!(load(&mut target, &dir.path().join("nope")).unwrap(), 0);
        assert!(target.is_empty());
    }

    #[test]
    fn test_load_skips_junk_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic.map");
        fs::write(
            &path,
            "fd00::1 203.0.113.1 99\n\
             not a binding\n\
             fd00::2 192.0.2.9 99\n\
             fd00::3 203.0.113.3 99 trailing\n",
        )
        .unwrap();
        let mut target = pool();
        assert_eq!(load(&mut target, &path).unwrap(), 1);
        assert_eq!(
            target.v4_for("fd00::1".parse().unwrap(), 100),
            Some("203.0.113.1".parse().unwrap())
        );
    }
}
