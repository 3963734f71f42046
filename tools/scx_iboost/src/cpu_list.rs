// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: kernel CPU list parsing
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;

/// Parse a kernel CPU list such as `0-3,6,8-9` as found in
/// `/sys/devices/system/cpu/{online,possible}`. Ids at or above `max_cpus`
/// are rejected. The result is sorted and free of duplicates.
pub fn parse_cpu_list(list: &str, max_cpus: usize) -> Result<Vec<usize>, String> {
    let mut cpus = BTreeSet::new();

    if list
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err(format!("Invalid character in CPU list {:?}", list.trim()));
    }

    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (start, end) = match token.split_once('-') {
            Some((start, end)) => (
                start.trim().parse::<usize>().map_err(|_| "Invalid range start")?,
                end.trim().parse::<usize>().map_err(|_| "Invalid range end")?,
            ),
            None => {
                let cpu = token
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid CPU: {}", token))?;
                (cpu, cpu)
            }
        };
        if start > end {
            return Err(format!("Invalid CPU range: {}-{}", start, end));
        }
        if end >= max_cpus {
            return Err(format!("CPU {} out of range (max {})", end, max_cpus));
        }
        cpus.extend(start..=end);
    }

    Ok(cpus.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::parse_cpu_list;

    #[test]
    fn parses_single_cpu() {
        assert_eq!(parse_cpu_list("3\n", 8).unwrap(), vec![3]);
    }

    #[test]
    fn parses_range_and_single() {
        assert_eq!(parse_cpu_list("5,0-2", 8).unwrap(), vec![0, 1, 2, 5]);
        assert_eq!(parse_cpu_list("0-1,1-2", 8).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn empty_list_is_empty() {
        assert!(parse_cpu_list("\n", 8).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_cpu_list("0-2,a", 8).is_err());
        assert!(parse_cpu_list("3-1", 8).is_err());
        assert!(parse_cpu_list("0-8", 8).is_err());
    }
}
