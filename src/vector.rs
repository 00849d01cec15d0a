//! Minimal 3D/4D vector types shared by the point record, the AABB math
//! and the frustum test. Kept deliberately small and `#[repr(C)]`/`Pod`
//! so they double as the on-disk layout for [`crate::point::Point`].

use std::ops::{Add, Div, Index, IndexMut, Mul, Not, Sub};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec3<T>(pub T, pub T, pub T);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec4<T>(pub T, pub T, pub T, pub T);

unsafe impl<T> bytemuck::Pod for Vec3<T> where T: bytemuck::Pod {}
unsafe impl<T> bytemuck::Pod for Vec4<T> where T: bytemuck::Pod {}

pub type Vec3f32 = Vec3<f32>;
pub type Vec4f32 = Vec4<f32>;

#[inline(always)]
pub const fn vec3f(f0: f32, f1: f32, f2: f32) -> Vec3<f32> {
    Vec3::<f32>(f0, f1, f2)
}

#[inline(always)]
pub const fn vec4f(f0: f32, f1: f32, f2: f32, f3: f32) -> Vec4<f32> {
    Vec4::<f32>(f0, f1, f2, f3)
}

pub fn dot<T>(v1: Vec3<T>, v2: Vec3<T>) -> T
where
    T: Mul<Output = T> + Add<Output = T>,
{
    v1.0 * v2.0 + v1.1 * v2.1 + v1.2 * v2.2
}

pub fn dot4<T>(v1: Vec4<T>, v2: Vec4<T>) -> T
where
    T: Mul<Output = T> + Add<Output = T>,
{
    v1.0 * v2.0 + v1.1 * v2.1 + v1.2 * v2.2 + v1.3 * v2.3
}

impl Vec3<f32> {
    pub fn magnitude(self) -> f32 {
        (self.0 * self.0 + self.1 * self.1 + self.2 * self.2).sqrt()
    }

    pub fn vec4(self, w: f32) -> Vec4<f32> {
        Vec4(self.0, self.1, self.2, w)
    }
}

impl<T> Add<Vec3<T>> for Vec3<T>
where
    T: Add<Output = T>,
{
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0, self.1 + rhs.1, self.2 + rhs.2)
    }
}

impl<T> Sub<Vec3<T>> for Vec3<T>
where
    T: Sub<Output = T>,
{
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0, self.1 - rhs.1, self.2 - rhs.2)
    }
}

impl<T> Mul<Vec3<T>> for Vec3<T>
where
    T: Mul<Output = T>,
{
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Self(self.0 * rhs.0, self.1 * rhs.1, self.2 * rhs.2)
    }
}

impl<T> Mul<T> for Vec3<T>
where
    T: Mul<Output = T> + Copy,
{
    type Output = Self;
    fn mul(self, rhs: T) -> Self::Output {
        Self(self.0 * rhs, self.1 * rhs, self.2 * rhs)
    }
}

impl<T> Div<T> for Vec3<T>
where
    T: Div<Output = T> + Copy,
{
    type Output = Self;
    fn div(self, rhs: T) -> Self::Output {
        Self(self.0 / rhs, self.1 / rhs, self.2 / rhs)
    }
}

impl<T> Index<u32> for Vec3<T> {
    type Output = T;
    fn index(&self, index: u32) -> &Self::Output {
        match index {
            0 => &self.0,
            1 => &self.1,
            2 => &self.2,
            _ => panic!("unexpected index {index}"),
        }
    }
}

impl<T> IndexMut<u32> for Vec3<T> {
    fn index_mut(&mut self, index: u32) -> &mut Self::Output {
        match index {
            0 => &mut self.0,
            1 => &mut self.1,
            2 => &mut self.2,
            _ => panic!("unexpected index {index}"),
        }
    }
}

impl<T> From<(T, T, T)> for Vec3<T> {
    fn from(value: (T, T, T)) -> Self {
        Vec3::<T>(value.0, value.1, value.2)
    }
}

impl<T> Vec3<T>
where
    T: PartialOrd<T>,
{
    pub fn lt(&self, rhs: Vec3<T>) -> Vec3<bool> {
        Vec3::<bool>(self.0 < rhs.0, self.1 < rhs.1, self.2 < rhs.2)
    }

    pub fn ge(&self, rhs: Vec3<T>) -> Vec3<bool> {
        Vec3::<bool>(self.0 >= rhs.0, self.1 >= rhs.1, self.2 >= rhs.2)
    }
}

impl Vec3<bool> {
    pub fn all(&self) -> bool {
        self.0 && self.1 && self.2
    }
}

impl Not for Vec3<bool> {
    type Output = Vec3<bool>;
    fn not(self) -> Self::Output {
        Vec3::<bool>(!self.0, !self.1, !self.2)
    }
}

impl<T> Add<Vec4<T>> for Vec4<T>
where
    T: Add<Output = T>,
{
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0, self.1 + rhs.1, self.2 + rhs.2, self.3 + rhs.3)
    }
}

impl<T> Index<u32> for Vec4<T> {
    type Output = T;
    fn index(&self, index: u32) -> &Self::Output {
        match index {
            0 => &self.0,
            1 => &self.1,
            2 => &self.2,
            3 => &self.3,
            _ => panic!("unexpected index {index}"),
        }
    }
}
