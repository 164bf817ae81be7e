//! Extraction of compiler flags from the output of `make -n`.
//!
//! The compilers are replaced by sentinel names on the make command line, so the one line of
//! the dry run that would compile the file is easy to find.

use std::path::Path;

pub const FAKE_CC: &str = "__LIBIDE_FAKE_CC__";
pub const FAKE_CXX: &str = "__LIBIDE_FAKE_CXX__";
pub const FAKE_VALAC: &str = "__LIBIDE_FAKE_VALAC__";

/// Extracts the flags from the first compiler line in `output`.
///
/// `include_base` is the directory relative `-I` paths are resolved against. Without it they
/// are kept as written. `subdir` prefixes relative Vala directories. Returns `None` if no line
/// invokes one of the sentinel compilers.
pub fn extract_flags(
    output: &str,
    include_base: Option<&Path>,
    subdir: &str,
) -> Option<Vec<String>> {
    let output = output.replace("\\\n", "  ");
    output
        .lines()
        .map(|line| line.strip_suffix('\\').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .find_map(|line| parse_line(line, include_base, subdir))
}

/// Parses one line of make output, if it invokes a sentinel compiler.
pub fn parse_line(line: &str, include_base: Option<&Path>, subdir: &str) -> Option<Vec<String>> {
    if let Some((_, args)) = line.split_once(FAKE_CXX) {
        let mut flags = vec!["-xc++".to_owned()];
        flags.extend(parse_compiler_args(args, include_base));
        Some(flags)
    } else if let Some((_, args)) = line.split_once(FAKE_CC) {
        Some(parse_compiler_args(args, include_base))
    } else if let Some((_, args)) = line.split_once(FAKE_VALAC) {
        Some(parse_valac_args(args, subdir))
    } else {
        None
    }
}

fn split_args(args: &str) -> Vec<String> {
    shlex::split(args.trim_start()).unwrap_or_else(|| {
        tracing::warn!(line = args, "Failed to split compiler command line");
        Vec::new()
    })
}

/// Keeps the flags of a C or C++ compiler command line that matter for code analysis.
///
/// Kept are include directories, `-f`, `-W` and `-m` options, defines, language selection and
/// `-std=`. Anything between backticks is skipped.
pub fn parse_compiler_args(args: &str, include_base: Option<&Path>) -> Vec<String> {
    let argv = split_args(args);
    let mut flags = Vec::new();
    let mut in_expand = false;
    let mut iter = argv.iter();

    while let Some(arg) = iter.next() {
        if arg.contains('`') {
            in_expand = !in_expand;
        }
        if in_expand || arg.len() < 2 {
            continue;
        }
        let Some(option) = arg.strip_prefix('-') else {
            continue;
        };

        match option.chars().next() {
            Some('I') => {
                let path = if option.len() == 1 {
                    match iter.next() {
                        Some(path) => path.as_str(),
                        None => continue,
                    }
                } else {
                    &option[1..]
                };
                flags.push(include_flag(path, include_base));
            }
            Some('f' | 'W' | 'm') => flags.push(arg.clone()),
            Some('D' | 'x') => {
                flags.push(arg.clone());
                if option.len() == 1 {
                    if let Some(value) = iter.next() {
                        flags.push(value.clone());
                    }
                }
            }
            _ if option.starts_with("std=") => flags.push(arg.clone()),
            _ => {}
        }
    }

    flags
}

fn include_flag(path: &str, include_base: Option<&Path>) -> String {
    match include_base {
        Some(base) if !Path::new(path).is_absolute() => {
            format!("-I{}", base.join(path).display())
        }
        _ => format!("-I{path}"),
    }
}

/// Keeps the package, target and search path options of a valac command line.
pub fn parse_valac_args(args: &str, subdir: &str) -> Vec<String> {
    const PATH_OPTIONS: [&str; 3] = ["--vapidir", "--girdir", "--metadatadir"];
    const VALUE_OPTIONS: [&str; 2] = ["--pkg", "--target-glib"];

    let argv = split_args(args);
    let mut flags = Vec::new();
    let mut iter = argv.iter().peekable();

    while let Some(arg) = iter.next() {
        let joined = arg.split_once('=');

        if joined.is_some_and(|(option, _)| VALUE_OPTIONS.contains(&option)) {
            flags.push(arg.clone());
        } else if let Some((option, path)) =
            joined.filter(|(option, _)| PATH_OPTIONS.contains(option))
        {
            flags.push(option.to_owned());
            flags.push(build_path(subdir, path));
        } else if VALUE_OPTIONS.iter().any(|o| arg.starts_with(o)) && iter.peek().is_some() {
            flags.push(arg.clone());
            flags.extend(iter.next().cloned());
        } else if PATH_OPTIONS.iter().any(|o| arg.starts_with(o)) {
            flags.push(arg.clone());
            if let Some(path) = iter.next() {
                flags.push(build_path(subdir, path));
            }
        } else if arg.starts_with("--thread") || arg.contains(".vapi") {
            flags.push(arg.clone());
        }
    }

    flags
}

fn build_path(subdir: &str, path: &str) -> String {
    if Path::new(path).is_absolute() {
        path.to_owned()
    } else {
        Path::new(subdir).join(path).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtick_expansion_is_skipped() {
        let flags = parse_line(
            "__LIBIDE_FAKE_CC__ -Iinc -DFOO -std=c99 'echo bar'",
            None,
            ".",
        );
        insta::assert_debug_snapshot!(flags, @r###"
        Some(
            [
                "-Iinc",
                "-DFOO",
                "-std=c99",
            ],
        )
        "###);

        let flags = parse_compiler_args(
            "-DA `pkg-config --cflags gtk4` -DB -O2 -o foo.o -c foo.c",
            None,
        );
        assert_eq!(flags, ["-DA", "-DB"]);
    }

    #[test]
    fn test_libtool_line() {
        let output = "\
make: Entering directory '/home/user/project/src'
/bin/bash ../libtool  --tag=CC   --mode=compile __LIBIDE_FAKE_CC__ -DHAVE_CONFIG_H -I. -I.. \\
  -I/usr/include/glib-2.0 -pthread -Wall -fPIC -m64 -D G_LOG_DOMAIN=\\\"ide\\\" -x c -g -O2 \\
  -MT libide_la-foo.lo -MD -MP -MF .deps/libide_la-foo.Tpo -c -o libide_la-foo.lo `test -f 'foo.c' || echo './'`foo.c
make: Leaving directory '/home/user/project/src'
";
        let flags = extract_flags(output, Some(Path::new("/home/user/project/src")), "src");
        insta::assert_debug_snapshot!(flags, @r###"
        Some(
            [
                "-DHAVE_CONFIG_H",
                "-I/home/user/project/src/.",
                "-I/home/user/project/src/..",
                "-I/usr/include/glib-2.0",
                "-Wall",
                "-fPIC",
                "-m64",
                "-D",
                "G_LOG_DOMAIN=\"ide\"",
                "-x",
                "c",
            ],
        )
        "###);
    }

    #[test]
    fn test_cxx_and_detached_include() {
        let flags = extract_flags(
            "__LIBIDE_FAKE_CXX__ -I include -I /opt/include -std=c++17 -c foo.cc\n",
            Some(Path::new("/p")),
            ".",
        )
        .unwrap();
        assert_eq!(
            flags,
            ["-xc++", "-I/p/include", "-I/opt/include", "-std=c++17"]
        );
    }

    #[test]
    fn test_first_compiler_line_wins() {
        let output = "echo building\n__LIBIDE_FAKE_CC__ -DFIRST\n__LIBIDE_FAKE_CC__ -DSECOND\n";
        assert_eq!(extract_flags(output, None, "."), Some(vec!["-DFIRST".into()]));
        assert_eq!(extract_flags("make: Nothing to be done\n", None, "."), None);
    }

    #[test]
    fn test_valac() {
        let line = "__LIBIDE_FAKE_VALAC__ --pkg=gtk4 --pkg json-glib-1.0 --target-glib=2.74 \
                    --vapidir=vapi --vapidir /usr/share/vala/vapi --girdir gir --thread \
                    config.vapi -C foo.vala";
        let flags = parse_line(line, None, "plugins").unwrap();
        insta::assert_debug_snapshot!(flags, @r###"
        [
            "--pkg=gtk4",
            "--pkg",
            "json-glib-1.0",
            "--target-glib=2.74",
            "--vapidir",
            "plugins/vapi",
            "--vapidir",
            "/usr/share/vala/vapi",
            "--girdir",
            "plugins/gir",
            "--thread",
            "config.vapi",
        ]
        "###);
    }
}
