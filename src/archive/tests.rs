//! Unit tests for archive packaging and extraction.

use std::io::{Read, Write};

use super::*;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Tree {
    _dir: TempDir,
    root: Utf8PathBuf,
    out: Utf8PathBuf,
}

#[fixture]
fn tree() -> Tree {
    let dir = TempDir::new().expect("tempdir");
    let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    let root = base.join("workspace");
    fs::create_dir_all(&root).expect("workspace dir");
    let out = base.join("workspace.zip");
    Tree {
        _dir: dir,
        root,
        out,
    }
}

fn open(path: &Utf8Path) -> zip::ZipArchive<File> {
    zip::ZipArchive::new(File::open(path).expect("open archive")).expect("read archive")
}

fn entry_names(path: &Utf8Path) -> Vec<String> {
    let archive = open(path);
    archive.file_names().map(str::to_owned).collect()
}

#[rstest]
fn single_handler_file_is_the_only_entry(tree: Tree) {
    fs::write(tree.root.join("handler.py"), "def handler(event, context):\n    pass\n")
        .expect("write handler");

    let summary = ArchivePackager::default()
        .package(&tree.root, &tree.out)
        .expect("package");

    assert_eq!(summary.files, 1);
    assert_eq!(entry_names(&tree.out), vec![String::from("handler.py")]);
}

#[cfg(unix)]
#[rstest]
fn preserves_contents_modes_and_links(tree: Tree) {
    use std::os::unix::fs::{PermissionsExt, symlink};

    fs::create_dir_all(tree.root.join("bin")).expect("bin dir");
    fs::create_dir_all(tree.root.join("empty")).expect("empty dir");
    fs::write(tree.root.join("bin/run.sh"), "#!/bin/sh\necho hi\n").expect("script");
    fs::set_permissions(tree.root.join("bin/run.sh"), fs::Permissions::from_mode(0o750))
        .expect("chmod script");
    fs::write(tree.root.join("data.txt"), "payload").expect("data");
    fs::set_permissions(tree.root.join("data.txt"), fs::Permissions::from_mode(0o600))
        .expect("chmod data");
    symlink("bin/run.sh", tree.root.join("start")).expect("symlink");

    let summary = ArchivePackager::default()
        .package(&tree.root, &tree.out)
        .expect("package");
    assert_eq!(
        summary,
        PackageSummary {
            directories: 2,
            files: 2,
            symlinks: 1,
        }
    );

    let mut archive = open(&tree.out);

    let mut script = archive.by_name("bin/run.sh").expect("script entry");
    assert_eq!(script.unix_mode().map(|mode| mode & 0o777), Some(0o750));
    let mut body = String::new();
    script.read_to_string(&mut body).expect("read script");
    assert_eq!(body, "#!/bin/sh\necho hi\n");
    drop(script);

    let data = archive.by_name("data.txt").expect("data entry");
    assert_eq!(data.unix_mode().map(|mode| mode & 0o777), Some(0o600));
    drop(data);

    let empty = archive.by_name("empty/").expect("directory entry");
    assert!(empty.is_dir());
    drop(empty);

    let mut link = archive.by_name("start").expect("link entry");
    assert_eq!(
        link.unix_mode().map(|mode| mode & 0o170_000),
        Some(0o120_000)
    );
    let mut target = String::new();
    link.read_to_string(&mut target).expect("read link target");
    assert_eq!(target, "bin/run.sh");
}

#[rstest]
fn skips_denylisted_directories(tree: Tree) {
    fs::create_dir_all(tree.root.join("__pycache__")).expect("cache dir");
    fs::write(tree.root.join("__pycache__/index.pyc"), "x").expect("pyc");
    fs::write(tree.root.join("index.py"), "x").expect("index");

    ArchivePackager::default()
        .package(&tree.root, &tree.out)
        .expect("package");

    assert_eq!(entry_names(&tree.out), vec![String::from("index.py")]);
}

#[rstest]
fn custom_excludes_replace_defaults(tree: Tree) {
    fs::create_dir_all(tree.root.join("node_modules/dep")).expect("deps");
    fs::write(tree.root.join("node_modules/dep/index.js"), "x").expect("dep file");
    fs::write(tree.root.join("index.js"), "x").expect("index");

    ArchivePackager::new([String::from("node_modules")])
        .package(&tree.root, &tree.out)
        .expect("package");

    assert_eq!(entry_names(&tree.out), vec![String::from("index.js")]);
}

#[cfg(unix)]
#[rstest]
fn dangling_symlink_aborts_packaging_and_discards_the_archive(tree: Tree) {
    std::fs::write(tree.root.join("a_first.txt"), "written before the failure").expect("file");
    std::os::unix::fs::symlink("missing.txt", tree.root.join("broken")).expect("symlink");

    let err = ArchivePackager::default()
        .package(&tree.root, &tree.out)
        .expect_err("broken link should abort");

    assert!(
        matches!(err, ArchiveError::BrokenSymlink { ref target, .. } if target == "missing.txt"),
        "unexpected error: {err}"
    );
    assert!(!tree.out.exists(), "partial archive should be removed");
}

#[rstest]
#[case("/srv/app/code", "/srv/app/lib/libfoo.so", "../lib/libfoo.so")]
#[case("/srv/app", "/srv/app/bin/tool", "bin/tool")]
#[case("/srv/app", "lib\\libfoo.so", "lib/libfoo.so")]
#[case("/srv/app/a/b", "/srv/other", "../../../other")]
fn portable_targets_are_relative_with_forward_slashes(
    #[case] link_dir: &str,
    #[case] target: &str,
    #[case] expected: &str,
) {
    assert_eq!(portable_link_target(Utf8Path::new(link_dir), target), expected);
}

#[rstest]
fn extracts_nested_tarball(tree: Tree) {
    let tarball = tree.root.join("srctl.tar.gz");
    let file = File::create(&tarball).expect("tarball");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let contents = b"cache-bytes";
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "classes/app/cache.bin", &contents[..])
        .expect("append");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
        .flush()
        .expect("flush");

    let dest = tree.root.join("artifact/shared");
    extract_tarball(&tarball, &dest).expect("extract");

    let restored = fs::read(dest.join("classes/app/cache.bin")).expect("restored file");
    assert_eq!(restored, contents);
}

#[rstest]
fn corrupt_tarball_is_an_extraction_error(tree: Tree) {
    let tarball = tree.root.join("srctl.tar.gz");
    fs::write(&tarball, "not a tarball").expect("write");

    let err = extract_tarball(&tarball, &tree.root.join("out")).expect_err("corrupt");

    assert!(matches!(err, ArchiveError::Extract { .. }));
}

#[rstest]
fn sibling_archive_path_appends_zip_extension() {
    assert_eq!(
        sibling_archive_path(Utf8Path::new("/tmp/trace-dump-tmp-1700000000000")),
        Utf8PathBuf::from("/tmp/trace-dump-tmp-1700000000000.zip")
    );
}
