// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pretty printers for reporting the run's configuration.
//!
//! Both printers draw a titled tree: each block of lines hangs off the title,
//! and the lines after the first line of a block are continuations of it.

use std::{borrow::Cow, sync::Mutex};

use log::Level;

const VERTICAL: char = '│';
const UP_AND_RIGHT: char = '└';
const VERTICAL_AND_RIGHT: char = '├';

type Block = Vec<Cow<'static, str>>;

lazy_static::lazy_static! {
    static ref WARNINGS: Mutex<Vec<Block>> = Mutex::new(vec![]);
}

/// Prefix every line of every block with the tree symbol it gets.
fn tree_lines(blocks: &[Block]) -> Vec<String> {
    let mut lines = vec![];
    for (i_block, block) in blocks.iter().enumerate() {
        let last_block = i_block + 1 == blocks.len();
        for (i_line, line) in block.iter().enumerate() {
            let symbol = if i_line > 0 {
                VERTICAL
            } else if last_block && block.len() == 1 {
                UP_AND_RIGHT
            } else {
                VERTICAL_AND_RIGHT
            };
            lines.push(format!("{symbol} {line}"));
        }
    }
    lines
}

fn draw(level: Level, title: &str, blocks: &[Block]) {
    log::log!(level, "{}", console::style(title).bold());
    for line in tree_lines(blocks) {
        log::log!(level, "{line}");
    }
    log::log!(level, "");
}

pub(crate) struct InfoPrinter {
    title: Cow<'static, str>,
    blocks: Vec<Block>,
}

impl InfoPrinter {
    pub(crate) fn new(title: Cow<'static, str>) -> InfoPrinter {
        InfoPrinter {
            title,
            blocks: vec![],
        }
    }

    pub(crate) fn push_line(&mut self, line: Cow<'static, str>) {
        self.blocks.push(vec![line]);
    }

    pub(crate) fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub(crate) fn display(self) {
        draw(Level::Info, &self.title, &self.blocks);
    }
}

/// Something that can be kept aside and shown with all the other warnings
/// when [`display_warnings`] is called.
pub(crate) trait Warn {
    fn warn(self);
}

fn push_warning(block: Block) {
    match WARNINGS.lock() {
        Ok(mut warnings) => warnings.push(block),
        // Nothing else touches the warnings while they're being pushed, so a
        // poisoned lock still holds usable data.
        Err(poisoned) => poisoned.into_inner().push(block),
    }
}

impl Warn for &'static str {
    fn warn(self) {
        push_warning(vec![self.into()]);
    }
}

impl Warn for String {
    fn warn(self) {
        push_warning(vec![self.into()]);
    }
}

impl Warn for Block {
    fn warn(self) {
        push_warning(self);
    }
}

/// Print out any warnings that have been collected as CLI arguments have been
/// parsed. This should only be called once, after all arguments have been
/// parsed into parameters.
pub(crate) fn display_warnings() {
    log::debug!("Displaying warnings");
    let blocks: Vec<Block> = match WARNINGS.lock() {
        Ok(mut warnings) => warnings.drain(..).collect(),
        Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    };
    if !blocks.is_empty() {
        draw(Level::Warn, "Warnings", &blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_symbols() {
        let blocks: Vec<Block> = vec![
            vec!["Input: a.raw".into()],
            vec!["Channels 0 to 2048".into(), "50 flagged".into()],
            vec!["Output: .".into()],
        ];
        assert_eq!(
            tree_lines(&blocks),
            [
                "├ Input: a.raw",
                "├ Channels 0 to 2048",
                "│ 50 flagged",
                "└ Output: .",
            ]
        );

        // A multi-line last block doesn't close the tree on its first line.
        let blocks: Vec<Block> = vec![vec!["a".into(), "b".into()]];
        assert_eq!(tree_lines(&blocks), ["├ a", "│ b"]);
        assert!(tree_lines(&[]).is_empty());
    }
}
