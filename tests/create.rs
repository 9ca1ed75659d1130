//! End-to-end create-torrent tests: real files on disk, hashed through the
//! disk engine, emitted as canonical metainfo and parsed back.

use std::fs;

use sha1::{Digest, Sha1};
use sha2::Sha256;

use coretorrent::{
    conf::DiskConf,
    create::{list_files, CreateFlags, CreateTorrent},
    metainfo::Metainfo,
};

#[tokio::test]
async fn test_single_file_v1_torrent() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hello.txt");
    fs::write(&file, b"Hello, world!").unwrap();

    let entries = list_files(&file, CreateFlags::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "hello.txt");
    assert_eq!(entries[0].size, 13);

    let mut ct =
        CreateTorrent::new(entries, 16384, CreateFlags::V1_ONLY).unwrap();
    assert_eq!(ct.num_pieces(), 1);
    assert_eq!(ct.files().total_size(), 13);

    ct.generate_hashes(dir.path(), DiskConf::default()).await.unwrap();
    let emitted = ct.emit().unwrap();

    let metainfo = Metainfo::from_bytes(&emitted).unwrap();
    assert_eq!(metainfo.info.name, "hello.txt");
    assert_eq!(metainfo.info.length, Some(13));
    assert_eq!(metainfo.info.piece_length, 16384);

    let expected: [u8; 20] = Sha1::digest(b"Hello, world!").into();
    assert_eq!(metainfo.info.pieces.as_deref(), Some(&expected[..]));

    // the emitted and recomputed info hashes agree
    assert_eq!(metainfo.info_hash_v1(), ct.info_hash_v1().unwrap());
}

#[tokio::test]
async fn test_two_file_v2_torrent_with_pad() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("a"), vec![0x61u8; 100]).unwrap();
    fs::write(root.join("b"), vec![0x62u8; 200]).unwrap();

    let entries = list_files(&root, CreateFlags::default()).unwrap();
    let mut ct =
        CreateTorrent::new(entries, 16384, CreateFlags::V2_ONLY).unwrap();

    // canonicalization inserted one pad between a and b
    let fs_model = ct.files();
    assert_eq!(fs_model.num_files(), 3);
    assert_eq!(fs_model.file_name(0), "t/a");
    assert!(fs_model.pad_file_at(1));
    assert_eq!(fs_model.file_size(1), 16384 - 100);
    assert_eq!(fs_model.file_name(2), "t/b");
    assert_eq!(fs_model.total_size(), 100 + 16284 + 200);

    ct.generate_hashes(dir.path(), DiskConf::default()).await.unwrap();

    // each file is a single block, so its root is the SHA-256 of its bytes
    let expected_a: [u8; 32] = Sha256::digest(&vec![0x61u8; 100]).into();
    let expected_b: [u8; 32] = Sha256::digest(&vec![0x62u8; 200]).into();
    assert_eq!(ct.files().root(0), Some(expected_a));
    assert_eq!(ct.files().root(2), Some(expected_b));

    let emitted = ct.emit().unwrap();
    let metainfo = Metainfo::from_bytes(&emitted).unwrap();
    assert!(metainfo.is_v2());
    assert!(!metainfo.is_v1());

    // single-piece files have no piece-layer entries
    assert!(metainfo.piece_layers().unwrap().is_empty());

    // parsing reconstructs the same layout, pad included
    let parsed = metainfo.file_storage().unwrap();
    assert_eq!(parsed.num_files(), 3);
    assert!(parsed.pad_file_at(1));
    assert_eq!(parsed.total_size(), 16584);
    assert_eq!(parsed.root(0), Some(expected_a));
    assert_eq!(parsed.root(2), Some(expected_b));
}

#[tokio::test]
async fn test_hybrid_torrent_with_piece_layers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    fs::create_dir(&root).unwrap();
    // a file spanning three pieces, to exercise the piece layers
    let big: Vec<u8> = (0..3 * 16384u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("big.bin"), &big).unwrap();

    let entries = list_files(&root, CreateFlags::default()).unwrap();
    let mut ct =
        CreateTorrent::new(entries, 16384, CreateFlags::default()).unwrap();
    ct.generate_hashes(dir.path(), DiskConf::default()).await.unwrap();

    let emitted = ct.emit().unwrap();
    let metainfo = Metainfo::from_bytes(&emitted).unwrap();
    // a hybrid torrent carries both hash models and both info hashes
    assert!(metainfo.is_v1());
    assert!(metainfo.is_v2());
    assert!(metainfo.info_hash_v1().is_some());
    assert!(metainfo.info_hash_v2().is_some());

    // v1 piece hashes are verifiable against the content
    let pieces = metainfo.info.pieces.as_ref().unwrap();
    assert_eq!(pieces.len(), 3 * 20);
    for piece in 0..3 {
        let bytes = &big[piece * 16384..(piece + 1) * 16384];
        let expected: [u8; 20] = Sha1::digest(bytes).into();
        assert_eq!(&pieces[piece * 20..piece * 20 + 20], &expected[..]);
    }

    // the piece layer of the file carries one root per piece, and they
    // hash the file's blocks
    let parsed = metainfo.file_storage().unwrap();
    let root_hash = parsed.root(0).unwrap();
    let layers = metainfo.piece_layers().unwrap();
    let layer = layers.get(&root_hash).unwrap();
    assert_eq!(layer.len(), 3);
    for (piece, piece_root) in layer.iter().enumerate() {
        let bytes = &big[piece * 16384..(piece + 1) * 16384];
        let expected: [u8; 32] = Sha256::digest(bytes).into();
        assert_eq!(piece_root, &expected);
    }
}

#[tokio::test]
async fn test_multi_file_hybrid_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("album");
    fs::create_dir_all(root.join("disc1")).unwrap();
    fs::write(root.join("disc1/track1.flac"), vec![1u8; 20000]).unwrap();
    fs::write(root.join("disc1/track2.flac"), vec![2u8; 5000]).unwrap();
    fs::write(root.join("readme.txt"), b"liner notes").unwrap();

    let entries = list_files(&root, CreateFlags::default()).unwrap();
    let mut ct = CreateTorrent::new(entries, 0, CreateFlags::default())
        .unwrap();
    // auto piece length picks the smallest table entry for a small input
    assert_eq!(ct.piece_length(), 16384);

    ct.generate_hashes(dir.path(), DiskConf::default()).await.unwrap();
    let emitted = ct.emit().unwrap();

    let metainfo = Metainfo::from_bytes(&emitted).unwrap();
    let parsed = metainfo.file_storage().unwrap();

    // same files, same sizes, same order as the creator's model
    assert_eq!(parsed.num_files(), ct.files().num_files());
    for i in 0..parsed.num_files() {
        assert_eq!(parsed.file_name(i), ct.files().file_name(i));
        assert_eq!(parsed.file_size(i), ct.files().file_size(i));
        assert_eq!(parsed.file_offset(i), ct.files().file_offset(i));
    }
    // every non-pad file starts on a piece boundary
    for i in 0..parsed.num_files() {
        if !parsed.pad_file_at(i) {
            assert_eq!(parsed.file_offset(i) % 16384, 0);
        }
    }
}
