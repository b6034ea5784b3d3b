// Copyright 2016 Google Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Method names the framework itself handles; a plugin author cannot
/// register a user method under any of these.
pub const RESERVED_METHODS: &[&str] = &["Activate", "Start", "Stop", "Ping", "RegisterCallback"];

/// Returns true if `name` is a reserved method name.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_METHODS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_and_start_are_both_reserved() {
        assert!(is_reserved("Activate"));
        assert!(is_reserved("Start"));
        assert!(is_reserved("Stop"));
        assert!(is_reserved("Ping"));
        assert!(is_reserved("RegisterCallback"));
    }

    #[test]
    fn user_method_names_are_not_reserved() {
        assert!(!is_reserved("Do"));
        assert!(!is_reserved("Work"));
        assert!(!is_reserved(""));
    }
}
