use super::*;

#[test]
fn test_copy_until_split_respects_boundary() {
    let splitter = BlockSplitter::new(5, 1024);
    let mut block = FileBlock::default();

    assert_eq!(splitter.copy_until_split(&mut block, 0, b"abcdefg"), 5);
    assert_eq!(block.contents, b"abcde");

    // offset past the boundary copies nothing
    assert_eq!(splitter.copy_until_split(&mut block, 5, b"fg"), 0);

    // overwrite within the block
    assert_eq!(splitter.copy_until_split(&mut block, 1, b"XY"), 2);
    assert_eq!(block.contents, b"aXYde");
}

#[test]
fn test_copy_until_split_zero_fills_gaps() {
    let splitter = BlockSplitter::new(10, 1024);
    let mut block = FileBlock::default();
    splitter.copy_until_split(&mut block, 0, b"ab");
    assert_eq!(splitter.copy_until_split(&mut block, 6, b"z"), 1);
    assert_eq!(block.contents, b"ab\0\0\0\0z");
}

#[test]
fn test_check_split_directions() {
    let splitter = BlockSplitter::new(5, 1024);

    let mut block = FileBlock::default();
    block.contents = b"abcdefg".to_vec();
    assert_eq!(splitter.check_split(&block, true), 2);

    block.contents = b"abcde".to_vec();
    assert_eq!(splitter.check_split(&block, true), 0);
    assert_eq!(splitter.check_split(&block, false), 0);

    block.contents = b"abc".to_vec();
    assert_eq!(splitter.check_split(&block, true), 0);
    assert_eq!(splitter.check_split(&block, false), -2);
}

#[test]
fn test_embed_threshold() {
    let splitter = BlockSplitter::new(5, 100);
    assert!(splitter.should_embed_changes(100));
    assert!(!splitter.should_embed_changes(101));
}
