/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    IndexOutOfBound,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Bitmap(Vec<u8>);

impl Bitmap {
    pub fn new(max_pos: usize, init_all_true: bool) -> Self {
        Bitmap(vec![if init_all_true { 255 } else { 0 }; (max_pos / 8) + 1])
    }

    // if success, return old value
    pub fn set(&mut self, pos: usize, val: bool) -> Result<bool, Error> {
        if pos > self.get_max_pos() {
            return Err(Error::IndexOutOfBound);
        }

        let (idx, u_pos) = self.get_idx_pos(pos);
        let old = self.get_by_idx_pos(idx, u_pos);
        self.set_by_idx_pos(idx, u_pos, val);
        Ok(old)
    }

    pub fn get(&self, pos: usize) -> Result<bool, Error> {
        if pos > self.get_max_pos() {
            return Err(Error::IndexOutOfBound);
        }
        let (idx, u_pos) = self.get_idx_pos(pos);
        Ok(self.get_by_idx_pos(idx, u_pos))
    }

    // max_pos equal to ((max/8)+1)*8-1, not equal the max, where max is new() first param.
    fn get_max_pos(&self) -> usize {
        self.0.len() * 8 - 1
    }

    // return vec index and u8 bit
    fn get_idx_pos(&self, pos: usize) -> (usize, u8) {
        (pos / 8, (pos % 8) as u8)
    }

    fn get_by_idx_pos(&self, idx: usize, u_pos: u8) -> bool {
        self.0.get(idx).unwrap() & (1 << u_pos) != 0
    }

    fn set_by_idx_pos(&mut self, idx: usize, u_pos: u8, val: bool) {
        if val {
            *(self.0.get_mut(idx).unwrap()) |= 1 << u_pos;
        } else {
            *(self.0.get_mut(idx).unwrap()) &= !(1 << u_pos);
        }
    }
}
