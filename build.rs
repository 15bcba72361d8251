//! Build script for ferrocoll
//!
//! Without the `mpi` feature this is a no-op. With it, the script locates an
//! MPI installation, compiles `csrc/ferrocoll.c` against it and emits the
//! link directives for the MPI library.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Compile and link flags for one MPI installation.
#[derive(Default)]
struct MpiFlags {
    source: String,
    includes: Vec<PathBuf>,
    lib_dirs: Vec<PathBuf>,
    libs: Vec<String>,
    version: Option<String>,
}

fn main() {
    for input in ["csrc/ferrocoll.c", "csrc/ferrocoll.h"] {
        println!("cargo:rerun-if-changed={input}");
    }
    for var in ["MPI_PKG_CONFIG", "MPICC", "MPI_HOME"] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let flags = match locate_mpi() {
        Some(flags) => flags,
        None => panic!(
            "ferrocoll: the `mpi` feature needs an MPI installation. Set MPI_PKG_CONFIG \
             to its pkg-config name, put `mpicc` on PATH (or point MPICC at it), \
             or set MPI_HOME to the install prefix"
        ),
    };
    eprintln!("ferrocoll: using MPI from {}", flags.source);

    let mut shim = cc::Build::new();
    shim.file("csrc/ferrocoll.c").include("csrc").warnings(true);
    shim.includes(&flags.includes);
    if env::var("PROFILE").as_deref() == Ok("release") {
        shim.opt_level(3);
    }
    shim.compile("ferrocoll");

    for dir in &flags.lib_dirs {
        println!("cargo:rustc-link-search=native={}", dir.display());
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir.display());
    }
    for lib in &flags.libs {
        println!("cargo:rustc-link-lib={lib}");
    }
    if let Some(version) = &flags.version {
        println!("cargo:rustc-env=FERROCOLL_MPI_VERSION={version}");
    }
}

/// Tries each discovery method in order: an explicit pkg-config name, the
/// common pkg-config names, the compiler wrapper, then an install prefix.
#[allow(clippy::let_and_return)]
fn locate_mpi() -> Option<MpiFlags> {
    let explicit = env::var("MPI_PKG_CONFIG").ok();
    let found = explicit
        .iter()
        .map(String::as_str)
        .chain(["mpich", "ompi", "mpi"])
        .find_map(from_pkg_config)
        .or_else(from_wrapper)
        .or_else(from_prefix);
    found
}

fn from_pkg_config(name: &str) -> Option<MpiFlags> {
    let lib = pkg_config::Config::new()
        .cargo_metadata(false)
        .probe(name)
        .ok()?;
    Some(MpiFlags {
        source: format!("pkg-config `{name}`"),
        includes: lib.include_paths,
        lib_dirs: lib.link_paths,
        libs: lib.libs,
        version: Some(lib.version),
    })
}

fn from_wrapper() -> Option<MpiFlags> {
    let wrapper = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_owned());
    let output = Command::new(&wrapper).arg("-show").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let mut flags = MpiFlags {
        source: format!("`{wrapper} -show`"),
        ..MpiFlags::default()
    };
    for token in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        if let Some(dir) = token.strip_prefix("-I") {
            flags.includes.push(dir.into());
        } else if let Some(dir) = token.strip_prefix("-L") {
            flags.lib_dirs.push(dir.into());
        } else if let Some(lib) = token.strip_prefix("-l") {
            flags.libs.push(lib.to_owned());
        }
    }
    if flags.libs.is_empty() {
        flags.libs.push("mpi".to_owned());
    }
    Some(flags)
}

fn from_prefix() -> Option<MpiFlags> {
    let prefixes = env::var("MPI_HOME")
        .ok()
        .into_iter()
        .chain(["/usr/local", "/usr", "/opt/openmpi", "/opt/mpich"].map(String::from));
    prefixes.map(PathBuf::from).find_map(|prefix| {
        let include = prefix.join("include");
        has_header(&include).then(|| MpiFlags {
            source: format!("prefix {}", prefix.display()),
            includes: vec![include],
            lib_dirs: vec![prefix.join("lib")],
            libs: vec!["mpi".to_owned()],
            version: None,
        })
    })
}

fn has_header(include: &Path) -> bool {
    include.join("mpi.h").is_file()
}
