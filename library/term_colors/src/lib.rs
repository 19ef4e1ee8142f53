//! term_colors is a collection of convenience functions for coloring
//! terminal log output. Pod names are conventionally `cyan`, healthy states
//! `green`, failures `red`, and durations/identifiers `orange`.

use ansi_term::Color;
use std::fmt::Display;

pub fn bold<T: Display>(input: T) -> String {
    ansi_term::Style::new().bold().paint(input.to_string()).to_string()
}

pub fn cyan<T: Display>(input: T) -> String {
    Color::Cyan.paint(input.to_string()).to_string()
}

pub fn green<T: Display>(input: T) -> String {
    Color::Green.paint(input.to_string()).to_string()
}

pub fn red<T: Display>(input: T) -> String {
    Color::Red.paint(input.to_string()).to_string()
}

pub fn yellow<T: Display>(input: T) -> String {
    Color::Yellow.paint(input.to_string()).to_string()
}

pub fn orange<T: Display>(input: T) -> String {
    Color::RGB(243, 113, 33).paint(input.to_string()).to_string()
}
